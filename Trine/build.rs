// build.rs
use std::env;
use std::path::PathBuf;

fn main() {
    // the kernel image embeds a filesystem image chosen at build time
    let image = match env::var("TRINE_FS_IMAGE") {
        Ok(path) => PathBuf::from(path),
        Err(_) => {
            let dir = env::var("CARGO_MANIFEST_DIR").unwrap_or_else(|_| String::from("."));
            PathBuf::from(dir).join("fs").join("filesys.img")
        }
    };
    println!("cargo:rustc-env=TRINE_FS_IMAGE={}", image.display());
    println!("cargo:rerun-if-env-changed=TRINE_FS_IMAGE");
    println!("cargo:rerun-if-changed={}", image.display());
}
