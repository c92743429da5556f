//! Declares the `linux_like` cfg and tracks the owner identifier baked in at
//! build time (`VEIL_PACKAGE`), which names the mappings the section remapper
//! rewrites.

fn main() {
    println!("cargo::rustc-check-cfg=cfg(linux_like)");
    println!("cargo:rerun-if-env-changed=VEIL_PACKAGE");

    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if matches!(target_os.as_str(), "linux" | "android") {
        println!("cargo:rustc-cfg=linux_like");
    }
}
