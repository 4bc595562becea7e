mod app;
mod archive;
mod backup;
mod catalog;
mod cli;
mod config;
mod dump;
mod environment;
mod formkey;
mod game;
mod library;
mod log;
mod merge;
mod nif;
mod portrait;
mod progress;
mod provenance;
mod selection;
mod skyrim;
mod snapshot;
mod template;

use anyhow::Result;

fn main() -> Result<()> {
    cli::run()
}
