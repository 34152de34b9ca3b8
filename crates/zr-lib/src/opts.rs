//! Options structs the CLI layer fills in. Construction is one call
//! taking the struct; defaults come from `Default` rather than a stack
//! of builder methods.

use camino::Utf8PathBuf;

#[derive(Debug, Default, Clone)]
pub struct Opts {
    pub run: RunOpts,
    pub cache: CacheOpts,
}

#[derive(Debug, Default, Clone)]
pub struct RunOpts {
    /// Worker pool size; `None` falls back to `[global] max_workers`
    /// and then to the host CPU count.
    pub concurrency: Option<usize>,
    /// Active profile; `None` falls back to `[global] default_profile`.
    pub profile: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CacheOpts {
    pub enabled: bool,
    /// Overrides the configured cache directory.
    pub override_dir: Option<Utf8PathBuf>,
}

impl Default for CacheOpts {
    fn default() -> Self {
        Self {
            enabled: true,
            override_dir: None,
        }
    }
}
