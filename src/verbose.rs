use std::collections::HashSet;
use std::str::FromStr;

/// One verbose-output channel. `All` (or bare `-v`) enables every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerboseTag {
    Build,
    Section,
    Elf,
    Patch,
    Library,
    Linking,
    Symbols,
    Nolib,
    All,
}

impl FromStr for VerboseTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "build" => VerboseTag::Build,
            "section" => VerboseTag::Section,
            "elf" => VerboseTag::Elf,
            "patch" => VerboseTag::Patch,
            "library" => VerboseTag::Library,
            "linking" => VerboseTag::Linking,
            "symbols" => VerboseTag::Symbols,
            "nolib" => VerboseTag::Nolib,
            "all" => VerboseTag::All,
            other => return Err(format!("unknown verbose tag '{other}'")),
        })
    }
}

impl VerboseTag {
    /// The `log` target prefix a stage logs records against for this channel.
    pub fn target_prefix(self) -> &'static str {
        match self {
            VerboseTag::Build => "patch::build",
            VerboseTag::Section => "patch::depgraph",
            VerboseTag::Elf => "patch::elf",
            VerboseTag::Patch => "patch::directives",
            VerboseTag::Library => "patch::units",
            VerboseTag::Linking => "patch::linker",
            VerboseTag::Symbols => "patch::finalize",
            VerboseTag::Nolib => "patch::nolib",
            VerboseTag::All => "patch",
        }
    }
}

/// Holds the set of channels enabled via `-v`/`--verbose-tag` and builds an
/// `env_logger` filter that only lets through records whose target matches
/// an enabled channel (or any record at `warn`/`error`, which always pass).
#[derive(Debug, Default, Clone)]
pub struct VerboseTags {
    tags: HashSet<VerboseTag>,
}

impl VerboseTags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable_all(&mut self) {
        self.tags.insert(VerboseTag::All);
    }

    pub fn enable(&mut self, tag: VerboseTag) {
        self.tags.insert(tag);
    }

    pub fn is_enabled(&self, tag: VerboseTag) -> bool {
        self.tags.contains(&VerboseTag::All) || self.tags.contains(&tag)
    }

    /// Installs a process-wide logger whose per-record verbosity is gated by
    /// these tags: `debug!`/`trace!` records are only shown for enabled
    /// channels, `info!`/`warn!`/`error!` always pass.
    pub fn install_logger(&self) {
        let tags = self.clone();
        let mut builder = env_logger::Builder::new();
        builder.format_timestamp(None);
        builder.filter_level(log::LevelFilter::Info);
        builder.filter_module("patch", log::LevelFilter::Info);
        for tag in [
            VerboseTag::Build,
            VerboseTag::Section,
            VerboseTag::Elf,
            VerboseTag::Patch,
            VerboseTag::Library,
            VerboseTag::Linking,
            VerboseTag::Symbols,
            VerboseTag::Nolib,
        ] {
            if tags.is_enabled(tag) {
                builder.filter_module(tag.target_prefix(), log::LevelFilter::Debug);
            }
        }
        let _ = builder.try_init();
    }
}
