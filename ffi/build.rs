//! Generates the C header for the host (`includes/KrecRustExtensions.h`) with cbindgen.

use std::env;
use std::path::PathBuf;

fn main() {
    let crate_dir = env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR is set by cargo");
    let header = PathBuf::from(&crate_dir).join("includes").join("KrecRustExtensions.h");

    let config = cbindgen::Config::from_file(PathBuf::from(&crate_dir).join("cbindgen.toml")).unwrap_or_default();

    match cbindgen::Builder::new().with_crate(&crate_dir).with_config(config).generate() {
        Ok(bindings) => {
            bindings.write_to_file(&header);
        },

        // The previous header, if any, is left as-is.
        Err(error) => {
            println!("cargo:warning=Unable to generate C header: {error}");
        },
    }

    println!("cargo:rerun-if-changed=src");
    println!("cargo:rerun-if-changed=cbindgen.toml");
}
