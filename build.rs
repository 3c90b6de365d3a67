//! Build script for generating protobuf code

use std::env;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("distcache_descriptor.bin");

    // Compile the .proto files with protox (a pure-Rust protoc implementation)
    // so the build doesn't depend on a `protoc` binary being installed.
    let file_descriptor_set = protox::compile(["proto/distcache.proto"], ["proto"])?;
    std::fs::write(
        &descriptor_path,
        prost::Message::encode_to_vec(&file_descriptor_set),
    )?;

    // Configure tonic-build
    let mut config = prost_build::Config::new();
    config.skip_protoc_run();
    config.file_descriptor_set_path(&descriptor_path);

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(&descriptor_path)
        .out_dir(&out_dir)
        .compile_with_config(
            config,
            &[
                "proto/distcache.proto",
            ],
            &["proto"],
        )?;

    // Tell cargo to rerun this build script if the proto files change
    println!("cargo:rerun-if-changed=proto/distcache.proto");

    Ok(())
}
