use super::{maps, scan::Signature};
use crate::types::{ExportInfo, HookError, ModuleInfo};
use core::ffi::{c_char, c_void};
use std::ffi::{CStr, CString};

// Kept local: older libc releases do not export these for Android.
const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

unsafe fn phdr_path(info: &libc::dl_phdr_info) -> String {
    if info.dlpi_name.is_null() || *info.dlpi_name == 0 {
        // Empty name is the main executable.
        return std::fs::read_link("/proc/self/exe")
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
    }
    CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
}

fn matches_module(name: &str, path: &str, wanted: &str) -> bool {
    name == wanted || (!path.is_empty() && path.ends_with(wanted))
}

/// Walk `dl_iterate_phdr` until `visit` returns `Some`.
fn with_each_object<T>(mut visit: impl FnMut(&libc::dl_phdr_info) -> Option<T>) -> Option<T> {
    struct Ctx<'a, T> {
        visit: &'a mut dyn FnMut(&libc::dl_phdr_info) -> Option<T>,
        found: Option<T>,
    }

    unsafe extern "C" fn callback<T>(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        let ctx = &mut *(data as *mut Ctx<'_, T>);
        match (ctx.visit)(&*info) {
            Some(found) => {
                ctx.found = Some(found);
                1
            }
            None => 0,
        }
    }

    let mut ctx = Ctx {
        visit: &mut visit,
        found: None,
    };
    unsafe {
        libc::dl_iterate_phdr(Some(callback::<T>), &mut ctx as *mut Ctx<'_, T> as *mut c_void);
    }
    ctx.found
}

unsafe fn module_info(info: &libc::dl_phdr_info) -> ModuleInfo {
    let path = phdr_path(info);
    let phdrs = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);

    let mut min_addr: Option<usize> = None;
    let mut max_addr = 0usize;
    for phdr in phdrs {
        if phdr.p_type == PT_LOAD && phdr.p_memsz > 0 {
            let start = phdr.p_vaddr as usize;
            let end = start + phdr.p_memsz as usize;
            min_addr = Some(min_addr.map_or(start, |m| m.min(start)));
            max_addr = max_addr.max(end);
        }
    }

    let name = if path.is_empty() {
        String::from("[unknown]")
    } else {
        basename(&path).to_string()
    };

    ModuleInfo {
        name,
        path,
        base_address: info.dlpi_addr as usize + min_addr.unwrap_or(0),
        size: min_addr.map_or(0, |min| max_addr - min),
    }
}

/// Enumerate all loaded shared objects via `dl_iterate_phdr`.
pub fn enumerate_modules() -> Vec<ModuleInfo> {
    let mut modules = Vec::new();
    with_each_object::<()>(|info| {
        modules.push(unsafe { module_info(info) });
        None
    });
    modules
}

/// Find a module known to the dynamic loader by basename or path suffix.
pub fn find_module_by_name(name: &str) -> Option<ModuleInfo> {
    with_each_object(|info| {
        let module = unsafe { module_info(info) };
        matches_module(&module.name, &module.path, name).then_some(module)
    })
}

/// Find a module by path suffix in `/proc/self/maps`.
///
/// Catches images the loader never registered, such as native code mapped
/// straight out of an APK split.
pub fn find_mapped_module(suffix: &str) -> Option<ModuleInfo> {
    let mappings = maps::read_self_maps().ok()?;
    let (base_address, size, path) = maps::span_for_suffix(&mappings, suffix)?;
    Some(ModuleInfo {
        name: basename(&path).to_string(),
        path,
        base_address,
        size,
    })
}

/// Resolve a symbol globally using `dlsym(RTLD_DEFAULT, ...)`.
pub fn find_global_export_by_name(symbol: &str) -> Result<usize, HookError> {
    let cstr = CString::new(symbol).map_err(|_| HookError::SymbolNotFound(symbol.to_string()))?;
    let p = unsafe { libc::dlsym(libc::RTLD_DEFAULT, cstr.as_ptr()) };
    if p.is_null() {
        Err(HookError::SymbolNotFound(symbol.to_string()))
    } else {
        Ok(p as usize)
    }
}

/// Resolve a symbol within one module.
///
/// Tries `dlopen(RTLD_NOLOAD) + dlsym` first, then walks the module's
/// in-memory dynamic symbol table. Never falls back to a global lookup, so a
/// same-named symbol in another library is not mistaken for this one.
pub fn find_export_by_name(module_name: &str, symbol: &str) -> Result<usize, HookError> {
    let module = find_module_by_name(module_name)
        .ok_or_else(|| HookError::ModuleNotLoaded(module_name.to_string()))?;
    export_of(&module, symbol)
}

/// The loaded object whose image starts inside `[start, start + size)`.
///
/// Maps a span found through `/proc/self/maps` (an APK split, say) back to
/// the object the loader registered for it under a different name.
pub fn find_module_in_range(start: usize, size: usize) -> Option<ModuleInfo> {
    let end = start.saturating_add(size);
    with_each_object(|info| {
        let module = unsafe { module_info(info) };
        (module.size > 0 && module.base_address >= start && module.base_address < end).then_some(module)
    })
}

/// Resolve a symbol exported by the object loaded inside `[start, start + size)`.
pub fn find_export_in_range(start: usize, size: usize, symbol: &str) -> Result<usize, HookError> {
    let module =
        find_module_in_range(start, size).ok_or_else(|| HookError::ModuleNotLoaded(format!("{start:#x}")))?;
    export_of(&module, symbol)
}

fn export_of(module: &ModuleInfo, symbol: &str) -> Result<usize, HookError> {
    let sym_cstr =
        CString::new(symbol).map_err(|_| HookError::SymbolNotFound(symbol.to_string()))?;

    for path in [&module.path, &module.name] {
        if path.is_empty() {
            continue;
        }
        let Ok(path_cstr) = CString::new(path.as_str()) else {
            continue;
        };
        unsafe {
            let handle = libc::dlopen(path_cstr.as_ptr(), libc::RTLD_NOLOAD | libc::RTLD_NOW);
            if handle.is_null() {
                continue;
            }
            let p = libc::dlsym(handle, sym_cstr.as_ptr());
            libc::dlclose(handle);
            // dlsym on a handle also searches its dependencies.
            if !p.is_null() && (p as usize).wrapping_sub(module.base_address) < module.size {
                return Ok(p as usize);
            }
        }
    }

    let base = module.base_address;
    with_each_object(|info| unsafe { (module_info(info).base_address == base).then(|| dynamic_exports(info)) })
        .ok_or_else(|| HookError::ModuleNotLoaded(module.name.clone()))?
        .into_iter()
        .find(|export| export.name == symbol)
        .map(|export| export.address)
        .ok_or_else(|| HookError::SymbolNotFound(symbol.to_string()))
}

/// First match of `signature` inside `[start, start + size)`, skipping unreadable pages.
pub fn scan_range(signature: &Signature, start: usize, size: usize) -> Option<usize> {
    let mappings = maps::read_self_maps().ok()?;
    maps::readable_ranges(&mappings, start, start + size)
        .into_iter()
        .find_map(|(lo, hi)| unsafe { signature.find_in_memory(lo, hi - lo) })
}

/// Like [`scan_range`], but only over mappings backed by the file at `path`.
///
/// Libraries the loader placed between a module's segments are skipped. An
/// empty `path` scans the whole window.
pub fn scan_module(signature: &Signature, start: usize, size: usize, path: &str) -> Option<usize> {
    if path.is_empty() {
        return scan_range(signature, start, size);
    }
    let mappings = maps::read_self_maps().ok()?;
    maps::owned_ranges(&mappings, start, start + size, path)
        .into_iter()
        .find_map(|(lo, hi)| unsafe { signature.find_in_memory(lo, hi - lo) })
}

mod elf {
    pub const DT_NULL: isize = 0;
    pub const DT_HASH: isize = 4;
    pub const DT_STRTAB: isize = 5;
    pub const DT_SYMTAB: isize = 6;
    pub const DT_GNU_HASH: isize = 0x6ffffef5;

    pub const STB_GLOBAL: u8 = 1;
    pub const STB_WEAK: u8 = 2;
    pub const SHN_UNDEF: u16 = 0;

    /// `ElfN_Dyn`: both fields are pointer-sized on either class.
    #[repr(C)]
    pub struct Dyn {
        pub d_tag: isize,
        pub d_val: usize,
    }

    #[cfg(target_pointer_width = "64")]
    #[repr(C)]
    pub struct Sym {
        pub st_name: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
        pub st_value: u64,
        pub st_size: u64,
    }

    #[cfg(target_pointer_width = "32")]
    #[repr(C)]
    pub struct Sym {
        pub st_name: u32,
        pub st_value: u32,
        pub st_size: u32,
        pub st_info: u8,
        pub st_other: u8,
        pub st_shndx: u16,
    }

    impl Sym {
        pub fn bind(&self) -> u8 {
            self.st_info >> 4
        }
    }
}

/// Exported (global or weak, defined) symbols from a module's dynamic table.
pub fn enumerate_exports(module_name: &str) -> Result<Vec<ExportInfo>, HookError> {
    with_each_object(|info| unsafe {
        let path = phdr_path(info);
        if !matches_module(basename(&path), &path, module_name) {
            return None;
        }
        Some(dynamic_exports(info))
    })
    .ok_or_else(|| HookError::ModuleNotLoaded(module_name.to_string()))
}

unsafe fn dynamic_exports(info: &libc::dl_phdr_info) -> Vec<ExportInfo> {
    let base = info.dlpi_addr as usize;
    let phdrs = core::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);
    let Some(dynamic) = phdrs
        .iter()
        .find(|p| p.p_type == PT_DYNAMIC)
        .map(|p| (base + p.p_vaddr as usize) as *const elf::Dyn)
    else {
        return Vec::new();
    };

    let (mut symtab, mut strtab, mut hash, mut gnu_hash) = (0usize, 0usize, 0usize, 0usize);
    let mut entry = dynamic;
    while (*entry).d_tag != elf::DT_NULL {
        match (*entry).d_tag {
            elf::DT_SYMTAB => symtab = (*entry).d_val,
            elf::DT_STRTAB => strtab = (*entry).d_val,
            elf::DT_HASH => hash = (*entry).d_val,
            elf::DT_GNU_HASH => gnu_hash = (*entry).d_val,
            _ => {}
        }
        entry = entry.add(1);
    }
    if symtab == 0 || strtab == 0 {
        return Vec::new();
    }

    // glibc relocates d_ptr entries in place, bionic and the vDSO leave them
    // as file addresses.
    let adjusted = symtab > base || strtab > base;
    let resolve = |val: usize| if adjusted { val } else { base + val };

    let nsyms = if hash != 0 {
        *(resolve(hash) as *const u32).add(1) as usize
    } else if gnu_hash != 0 {
        gnu_hash_nsyms(resolve(gnu_hash) as *const u32)
    } else {
        return Vec::new();
    };

    let symtab = resolve(symtab) as *const elf::Sym;
    let strtab = resolve(strtab) as *const u8;
    (0..nsyms)
        .map(|i| &*symtab.add(i))
        .filter(|sym| {
            sym.st_shndx != elf::SHN_UNDEF
                && sym.st_value != 0
                && sym.st_name != 0
                && matches!(sym.bind(), elf::STB_GLOBAL | elf::STB_WEAK)
        })
        .map(|sym| ExportInfo {
            name: CStr::from_ptr(strtab.add(sym.st_name as usize) as *const c_char)
                .to_string_lossy()
                .into_owned(),
            address: base + sym.st_value as usize,
        })
        .collect()
}

/// Symbol count implied by a `DT_GNU_HASH` table.
unsafe fn gnu_hash_nsyms(table: *const u32) -> usize {
    let nbuckets = *table as usize;
    let symoffset = *table.add(1);
    let bloom_size = *table.add(2) as usize;

    // Bloom words are ELFCLASS-sized.
    let bloom = table.add(4) as *const usize;
    let buckets = bloom.add(bloom_size) as *const u32;
    let chains = buckets.add(nbuckets);

    let max_sym = (0..nbuckets).map(|i| *buckets.add(i)).max().unwrap_or(0);
    if max_sym < symoffset {
        return symoffset as usize;
    }

    // The chain for the last bucket ends on the entry with bit 0 set.
    let mut idx = max_sym;
    while *chains.add((idx - symoffset) as usize) & 1 == 0 {
        idx += 1;
    }
    idx as usize + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn libc_module() -> ModuleInfo {
        let malloc = find_global_export_by_name("malloc").expect("malloc should resolve");
        enumerate_modules()
            .into_iter()
            .find(|m| malloc >= m.base_address && malloc < m.base_address + m.size)
            .expect("malloc lives in a loaded module")
    }

    #[test]
    fn enumerate_modules_finds_libc() {
        let modules = enumerate_modules();
        assert!(modules.iter().any(|m| m.name.starts_with("libc")), "{modules:?}");
    }

    #[test]
    fn global_export_resolves_malloc() {
        assert_ne!(find_global_export_by_name("malloc").unwrap(), 0);
        assert!(matches!(
            find_global_export_by_name("veil_definitely_missing_symbol"),
            Err(HookError::SymbolNotFound(_))
        ));
    }

    #[test]
    fn module_export_matches_global_export() {
        let module = libc_module();
        let global = find_global_export_by_name("malloc").unwrap();
        let scoped = find_export_by_name(&module.name, "malloc").unwrap();
        assert_eq!(global, scoped);
    }

    #[test]
    fn dynamic_table_contains_malloc() {
        let module = libc_module();
        let exports = enumerate_exports(&module.name).unwrap();
        assert!(exports.iter().any(|e| e.name == "malloc"));
    }

    #[test]
    fn missing_module_is_reported() {
        assert!(matches!(
            find_export_by_name("libveil_missing.so", "malloc"),
            Err(HookError::ModuleNotLoaded(_))
        ));
        assert!(find_module_by_name("libveil_missing.so").is_none());
        assert!(find_mapped_module("libveil_missing.so").is_none());
    }

    #[test]
    fn mapped_module_covers_loader_view() {
        let module = libc_module();
        let mapped = find_mapped_module(&module.name).expect("libc is file-backed");
        let malloc = find_global_export_by_name("malloc").unwrap();
        assert_eq!(mapped.base_address, module.base_address);
        assert!(malloc >= mapped.base_address && malloc < mapped.base_address + mapped.size);
    }

    #[test]
    fn range_lookup_finds_object_under_another_name() {
        let libc = libc_module();
        let mapped = find_mapped_module(&libc.name).expect("libc is file-backed");
        let found = find_module_in_range(mapped.base_address, mapped.size).unwrap();
        assert_eq!(found.base_address, libc.base_address);

        let malloc = find_export_in_range(mapped.base_address, mapped.size, "malloc").unwrap();
        assert_eq!(malloc, find_global_export_by_name("malloc").unwrap());
        assert!(matches!(
            find_export_in_range(mapped.base_address, mapped.size, "veil_definitely_missing_symbol"),
            Err(HookError::SymbolNotFound(_))
        ));
    }

    #[test]
    fn range_lookup_outside_any_object_fails() {
        let buf = vec![0u8; 64];
        assert!(matches!(
            find_export_in_range(buf.as_ptr() as usize, buf.len(), "malloc"),
            Err(HookError::ModuleNotLoaded(_))
        ));
    }

    #[test]
    fn module_scan_ignores_foreign_mappings() {
        let buf: Vec<u8> = b"....veil-marker-\x01\x02\x03...".to_vec();
        let sig = Signature::parse("6D 61 72 6B ?? 72 2D 01").unwrap();
        let start = buf.as_ptr() as usize;
        assert_eq!(scan_module(&sig, start, buf.len(), ""), Some(start + 9));
        assert_eq!(scan_module(&sig, start, buf.len(), "/data/app/libclient.so"), None);
    }

    #[test]
    fn scan_range_finds_bytes_in_heap() {
        let buf: Vec<u8> = b"....veil-marker-\x01\x02\x03...".to_vec();
        let sig = Signature::parse("6D 61 72 6B ?? 72 2D 01").unwrap();
        let start = buf.as_ptr() as usize;
        assert_eq!(scan_range(&sig, start, buf.len()), Some(start + 9));
    }
}
