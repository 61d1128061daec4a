//! On-disk layout of the store.
//!
//! Content lives under `sha1/<aa>/<bb>/<cc>/<40-hex>` where the prefixes
//! are the first three hex pairs of the hash; link sidecars add a `.link`
//! extension; trashed content mirrors the layout under `sha1-trash/`;
//! scratch files live under `tmp/`.

use kachery_core::Sha1Hash;
use rand::distr::{Alphanumeric, SampleString};
use std::path::{Path, PathBuf};

pub fn content_path(storage_dir: &Path, sha1: &Sha1Hash) -> PathBuf {
    fanout(storage_dir.join("sha1"), sha1)
}

pub fn link_path(storage_dir: &Path, sha1: &Sha1Hash) -> PathBuf {
    let mut path = content_path(storage_dir, sha1).into_os_string();
    path.push(".link");
    PathBuf::from(path)
}

pub fn trash_path(storage_dir: &Path, sha1: &Sha1Hash) -> PathBuf {
    fanout(storage_dir.join("sha1-trash"), sha1)
}

/// Scratch path `tmp/<prefix>-<rand10>` on the same filesystem as the
/// final destinations.
pub fn scratch_path(storage_dir: &Path, prefix: &str) -> PathBuf {
    storage_dir
        .join("tmp")
        .join(format!("{prefix}-{}", random_suffix()))
}

/// Install temp `<dest>.<rand10>.<ext>` next to its destination.
pub fn install_tmp_path(dest: &Path, ext: &str) -> PathBuf {
    let mut path = dest.to_path_buf().into_os_string();
    path.push(format!(".{}.{ext}", random_suffix()));
    PathBuf::from(path)
}

fn fanout(base: PathBuf, sha1: &Sha1Hash) -> PathBuf {
    let (a, b, c) = sha1.fanout_prefixes();
    base.join(a).join(b).join(c).join(sha1.to_hex())
}

fn random_suffix() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 10)
}
