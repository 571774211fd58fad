use prost::Message;
use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);

    // protox compiles the descriptors in pure Rust, so no system protoc
    // installation is required.
    let file_descriptor_set = protox::compile(["proto/chat.proto"], ["proto"])?;

    // The encoded descriptor set feeds gRPC reflection in development.
    std::fs::write(
        out_dir.join("chat_descriptor.bin"),
        file_descriptor_set.encode_to_vec(),
    )?;

    tonic_build::configure().compile_fds(file_descriptor_set)?;

    println!("cargo:rerun-if-changed=proto/chat.proto");
    Ok(())
}
