// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;

mod allocator;
mod app;
mod archive;
mod config;
mod depgraph;
mod directives;
mod elf;
mod error;
mod finalize;
mod linker;
mod pipeline;
mod rebuild_cache;
mod rewrite;
mod rom;
mod trampoline;
mod units;
mod verbose;

use app::AppContext;
use error::{push_context, render_with_context};
use rebuild_cache::RebuildCache;
use rom::header::NdsHeader;
use verbose::{VerboseTag, VerboseTags};

/// Build-and-patch toolchain: compiles user code, links it against a ROM's
/// own symbols, and rewrites the ROM's ARM9/ARM7 binaries and overlays in
/// place according to a JSON patch configuration.
#[derive(Debug, Parser)]
#[clap(name = "ncpatcher", about = "Build-and-patch toolchain for NDS-style ROMs")]
struct Cli {
    /// Path to the patch configuration (JSON).
    #[clap(default_value = "ncpatcher.json")]
    config: PathBuf,

    /// Enable verbose logging for every diagnostic channel.
    #[clap(short, long)]
    verbose: bool,

    /// Enable verbose logging for a specific channel; may be repeated.
    #[clap(long = "verbose-tag", value_name = "TAG")]
    verbose_tags: Vec<String>,

    /// Define a preprocessor symbol available to `${...}` config expansion
    /// and passed through to compiled sources; may be repeated.
    #[clap(short = 'D', long = "define", value_name = "NAME[=VALUE]")]
    defines: Vec<String>,
}

fn run(cli: Cli) -> Result<()> {
    let mut tags = VerboseTags::new();
    if cli.verbose {
        tags.enable_all();
    }
    for raw in &cli.verbose_tags {
        let tag: VerboseTag = raw.parse().map_err(anyhow::Error::msg)?;
        tags.enable(tag);
    }
    tags.install_logger();

    let ctx = AppContext::new(cli.config.clone(), tags, cli.defines.clone());

    let _guard = push_context(format!("loading configuration {}", ctx.config_path.display()));
    let config = config::Config::from_file(&ctx.config_path, cli.defines)
        .with_context(|| format!("loading {}", ctx.config_path.display()))?;
    drop(_guard);

    let header_path = config.filesystem.join("header.bin");
    let header_bytes = std::fs::read(&header_path)
        .with_context(|| format!("reading ROM header {}", header_path.display()))?;
    let header = NdsHeader::parse(&header_bytes)?;

    let cache_path = config.backup.join("rebuild.bin");
    let mut cache = RebuildCache::load(&cache_path)?;

    if let Some(target) = &config.arm9 {
        pipeline::run_target(&ctx, &config, target, true, &header, &mut cache)?;
    }
    if let Some(target) = &config.arm7 {
        pipeline::run_target(&ctx, &config, target, false, &header, &mut cache)?;
    }

    cache.build_config_write_time = config.buildhash as i64;
    cache.save(&cache_path)?;

    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", render_with_context(&err));
            ExitCode::FAILURE
        }
    }
}
