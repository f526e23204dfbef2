use directories::ProjectDirs;
use std::path::PathBuf;

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "clementine", "stem-mixer")
}

/// Where completed separations are indexed between runs.
pub fn default_cache_dir() -> PathBuf {
    project_dirs()
        .map(|d| d.cache_dir().join("stem_cache"))
        .unwrap_or_else(|| std::env::temp_dir().join("stem-mixer").join("stem_cache"))
}

/// Scratch location for per-job output directories.
pub fn default_output_dir() -> PathBuf {
    std::env::temp_dir().join("stem-mixer").join("stems")
}
