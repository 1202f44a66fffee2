//! Build script for generating Rust code from protobuf definitions.

use std::path::PathBuf;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from("src/generated");

    // Create output directory if it doesn't exist
    std::fs::create_dir_all(&out_dir)?;

    // Proto files to compile
    let proto_files = vec![
        PathBuf::from("proto/csi.proto"),
        PathBuf::from("proto/replication.proto"),
    ];

    // Check which proto files exist
    let existing_protos: Vec<PathBuf> = proto_files
        .into_iter()
        .filter(|p| {
            if p.exists() {
                println!("cargo:rerun-if-changed={}", p.display());
                true
            } else {
                println!("cargo:warning=Proto file not found: {:?}", p);
                false
            }
        })
        .collect();

    if existing_protos.is_empty() {
        println!("cargo:warning=No proto files found");
        return Ok(());
    }

    // Parse the proto files with a pure-Rust protobuf compiler (no system
    // `protoc`/cmake toolchain available in this environment), then hand the
    // resulting descriptor set to prost-build/tonic-build exactly as
    // `compile()` would have.
    let descriptor_bytes = {
        use protox::prost::Message;
        protox::compile(&existing_protos, [PathBuf::from("proto")])?.encode_to_vec()
    };
    let file_descriptor_set =
        <prost_types::FileDescriptorSet as prost::Message>::decode(descriptor_bytes.as_slice())?;

    let mut config = prost_build::Config::new();
    config.out_dir(&out_dir);
    config.service_generator(
        tonic_build::configure()
            .build_server(true)
            .build_client(true)
            .service_generator(),
    );
    config.compile_fds(file_descriptor_set)?;

    Ok(())
}
