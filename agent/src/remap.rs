//! Section remapping.
//!
//! Replaces every file-backed mapping whose path contains the owner
//! identifier with an anonymous copy at the same address, so the library no
//! longer shows up by path in `/proc/self/maps`. Runs once, after hooks are
//! installed; failures are logged per region and never abort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use log::{debug, info, warn};
use veil_intercept::module::maps;
use veil_intercept::MemoryMapping;

use crate::error::RemapError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RemapReport {
    pub remapped: usize,
    pub failed: usize,
}

/// Armed at process attach with the owner identifier, fired once by the
/// orchestrator.
#[derive(Debug, Default)]
pub struct SectionRemapper {
    owner: OnceLock<String>,
    fired: AtomicBool,
}

impl SectionRemapper {
    pub const fn new() -> Self {
        Self {
            owner: OnceLock::new(),
            fired: AtomicBool::new(false),
        }
    }

    /// Returns false if already armed.
    pub fn arm(&self, owner: &str) -> bool {
        self.owner.set(owner.to_string()).is_ok()
    }

    pub fn is_armed(&self) -> bool {
        self.owner.get().is_some()
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Remap the owner's mappings. `None` when not armed or already fired.
    pub fn fire(&self) -> Option<RemapReport> {
        let owner = self.owner.get()?;
        if self.fired.swap(true, Ordering::AcqRel) {
            return None;
        }
        match remap_sections(owner) {
            Ok(report) => {
                info!("remapped {} regions of {owner} ({} failed)", report.remapped, report.failed);
                Some(report)
            }
            Err(e) => {
                warn!("section remapping skipped: {e}");
                Some(RemapReport::default())
            }
        }
    }
}

/// Remap every mapping whose path contains `owner`.
pub fn remap_sections(owner: &str) -> Result<RemapReport, RemapError> {
    let targets: Vec<MemoryMapping> = maps::read_self_maps()?
        .into_iter()
        .filter(|m| !m.path.is_empty() && m.path.contains(owner))
        .collect();

    let mut report = RemapReport::default();
    for mapping in &targets {
        match unsafe { remap_region(mapping) } {
            Ok(()) => {
                debug!("remapped {:#x}-{:#x} {}", mapping.start, mapping.end, mapping.path);
                report.remapped += 1;
            }
            Err(e) => {
                warn!("{:#x}-{:#x} {}: {e}", mapping.start, mapping.end, mapping.path);
                report.failed += 1;
            }
        }
    }
    Ok(report)
}

/// Copy `mapping` into anonymous memory and move the copy over it.
///
/// # Safety
/// Other threads writing to a writable region during the copy lose those writes.
#[cfg(linux_like)]
unsafe fn remap_region(mapping: &MemoryMapping) -> Result<(), RemapError> {
    use crate::error::errno;

    let start = mapping.start;
    let size = mapping.size();
    let prot = mapping.protection.to_prot();

    let copy = libc::mmap(
        core::ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
    );
    if copy == libc::MAP_FAILED {
        return Err(RemapError::Map { size, errno: errno() });
    }

    let result = (|| {
        if !mapping.protection.read && libc::mprotect(start as *mut _, size, prot | libc::PROT_READ) != 0 {
            return Err(RemapError::Protect { address: start, errno: errno() });
        }
        core::ptr::copy_nonoverlapping(start as *const u8, copy as *mut u8, size);

        // The copy takes its final protection before it replaces the original:
        // this code may itself be running from the region.
        if libc::mprotect(copy, size, prot) != 0 {
            return Err(RemapError::Protect {
                address: copy as usize,
                errno: errno(),
            });
        }
        let moved = libc::mremap(copy, size, size, libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED, start as *mut libc::c_void);
        if moved == libc::MAP_FAILED {
            return Err(RemapError::Remap { address: start, errno: errno() });
        }
        Ok(())
    })();

    match result {
        Ok(()) => {
            if mapping.protection.exec {
                veil_intercept::code::cache::invalidate_icache(start as *mut u8, size);
            }
            Ok(())
        }
        Err(e) => {
            libc::munmap(copy, size);
            if !mapping.protection.read {
                libc::mprotect(start as *mut _, size, prot);
            }
            Err(e)
        }
    }
}

#[cfg(not(linux_like))]
unsafe fn remap_region(_mapping: &MemoryMapping) -> Result<(), RemapError> {
    Err(RemapError::Unsupported)
}

#[cfg(all(test, linux_like))]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;

    fn mapped_file(name_hint: &str, pages: usize) -> (tempfile::NamedTempFile, *mut u8, usize) {
        let page = veil_intercept::code::page_size();
        let size = page * pages;
        let mut file = tempfile::Builder::new().prefix(name_hint).tempfile().unwrap();
        let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_file().as_raw_fd(),
                0,
            )
        };
        assert_ne!(ptr, libc::MAP_FAILED);
        (file, ptr as *mut u8, size)
    }

    fn mapped_paths() -> Vec<String> {
        maps::read_self_maps().unwrap().into_iter().map(|m| m.path).collect()
    }

    #[test]
    fn file_mapping_becomes_anonymous_with_same_bytes() {
        let owner = format!("veil-remap-{}", std::process::id());
        let (file, ptr, size) = mapped_file(&owner, 2);
        let path = file.path().to_string_lossy().into_owned();
        assert!(mapped_paths().iter().any(|p| p == &path));

        let report = remap_sections(&owner).unwrap();
        assert_eq!(report, RemapReport { remapped: 1, failed: 0 });

        assert!(!mapped_paths().iter().any(|p| p.contains(&owner)));
        let bytes = unsafe { std::slice::from_raw_parts(ptr, size) };
        assert!(bytes.iter().enumerate().all(|(i, &b)| b == (i % 251) as u8));

        let region = maps::read_self_maps()
            .unwrap()
            .into_iter()
            .find(|m| m.contains(ptr as usize))
            .unwrap();
        assert!(region.protection.read && !region.protection.write);

        unsafe { libc::munmap(ptr as *mut _, size) };
    }

    #[test]
    fn unreadable_region_keeps_its_protection() {
        let owner = format!("veil-noread-{}", std::process::id());
        let (_file, ptr, size) = mapped_file(&owner, 1);
        unsafe { libc::mprotect(ptr as *mut _, size, libc::PROT_NONE) };

        let report = remap_sections(&owner).unwrap();
        assert_eq!(report.remapped, 1);

        let region = maps::read_self_maps()
            .unwrap()
            .into_iter()
            .find(|m| m.contains(ptr as usize))
            .unwrap();
        assert!(!region.protection.read);
        assert!(region.path.is_empty() || !region.path.contains(&owner));

        unsafe {
            libc::mprotect(ptr as *mut _, size, libc::PROT_READ);
            assert_eq!(*ptr.add(7), 7);
            libc::munmap(ptr as *mut _, size);
        }
    }

    #[test]
    fn remapper_fires_once_and_only_when_armed() {
        let owner = format!("veil-once-{}", std::process::id());
        let (_file, ptr, size) = mapped_file(&owner, 1);

        let remapper = SectionRemapper::new();
        assert!(remapper.fire().is_none());

        assert!(remapper.arm(&owner));
        assert!(!remapper.arm("something-else"));
        assert_eq!(remapper.fire(), Some(RemapReport { remapped: 1, failed: 0 }));
        assert!(remapper.has_fired());
        assert!(remapper.fire().is_none());

        unsafe { libc::munmap(ptr as *mut _, size) };
    }

    #[test]
    fn no_matching_mapping_is_empty_report() {
        let report = remap_sections("veil-no-such-owner-anywhere").unwrap();
        assert_eq!(report, RemapReport::default());
    }
}
