//! Artifacts directory discovery and temporary executable rendering.
//!
//! Artifact template components resolve below an on-disk artifacts store.
//! The store is found by probing the two well-known roots and then walking
//! up from the running executable's own path, so relocated installations
//! keep working without configuration.

use core::ffi::CStr;

use tg_arena::Arena;
use tg_syscall as sys;
use tg_util::{Table, parent_dir};

use crate::ManifestError;

const ARTIFACTS_SUFFIX: &[u8] = b"/.tangram/artifacts";

/// Probe order: the root store, the /opt store, then every ancestor of
/// `/proc/self/exe`.
pub fn find_artifacts_dir(arena: &Arena) -> Result<&[u8], ManifestError> {
    if sys::stat(c"/.tangram/artifacts").is_ok() {
        return Ok(b"/.tangram/artifacts");
    }
    if sys::stat(c"/opt/tangram/artifacts").is_ok() {
        return Ok(b"/opt/tangram/artifacts");
    }

    let mut buf = [0u8; 4096];
    let len = sys::readlink(c"/proc/self/exe", &mut buf).map_err(ManifestError::Sys)?;
    let exe = arena.alloc_bytes(&buf[..len]);
    search_upward(arena, exe)
}

/// Walk `start`'s ancestors looking for one that contains the artifacts
/// store.
pub fn search_upward<'a>(arena: &'a Arena, start: &[u8]) -> Result<&'a [u8], ManifestError> {
    let mut current = start;
    loop {
        current = parent_dir(current).ok_or(ManifestError::ArtifactsDirNotFound)?;
        let candidate = if current == b"/" {
            arena.alloc_bytes(ARTIFACTS_SUFFIX)
        } else {
            let joined = arena.alloc_slice_fill_copy(current.len() + ARTIFACTS_SUFFIX.len(), 0u8);
            joined[..current.len()].copy_from_slice(current);
            joined[current.len()..].copy_from_slice(ARTIFACTS_SUFFIX);
            joined
        };
        let path = arena.alloc_cstr(candidate);
        if sys::stat(path).is_ok() {
            return Ok(candidate);
        }
    }
}

const ALPHABET: &[u8; 64] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ-_";

/// Fill the last six bytes of `path` with random characters drawn from the
/// 64-character alphabet.
fn mktemp(path: &mut [u8]) -> Result<(), ManifestError> {
    let offset = path.len() - 6;
    let suffix = &mut path[offset..];
    let n = sys::getrandom(suffix, sys::GRND_NONBLOCK).map_err(ManifestError::Sys)?;
    if n != 6 {
        return Err(ManifestError::ShortRandom);
    }
    for byte in suffix {
        *byte = ALPHABET[(*byte & 63) as usize];
    }
    Ok(())
}

fn write_all(fd: i32, mut bytes: &[u8]) -> Result<(), ManifestError> {
    while !bytes.is_empty() {
        let written = sys::write(fd, bytes).map_err(ManifestError::Sys)?;
        if written == 0 {
            break;
        }
        bytes = &bytes[written..];
    }
    Ok(())
}

/// Write `content` to a fresh `$TEMP ?? /tmp` file and return its path.
pub fn render_to_temp<'a>(
    arena: &'a Arena,
    env: &Table<'a>,
    content: &[u8],
) -> Result<&'a [u8], ManifestError> {
    let temp: &[u8] = env.lookup(b"TEMP").unwrap_or(b"/tmp");

    // <temp>/tmp.XXXXXX
    let path = arena.alloc_slice_fill_copy(temp.len() + 5 + 6, 0u8);
    path[..temp.len()].copy_from_slice(temp);
    path[temp.len()..temp.len() + 5].copy_from_slice(b"/tmp.");
    mktemp(path)?;

    let cpath: &CStr = arena.alloc_cstr(path);
    let fd = sys::open(cpath, sys::O_RDWR | sys::O_CREAT, 0o664).map_err(ManifestError::Sys)?;
    let result = write_all(fd, content);
    let _ = sys::close(fd);
    result?;

    Ok(path)
}
