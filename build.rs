fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc so the build does not depend on a
    // system-wide protobuf installation.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    tonic_build::configure()
        .build_client(false)
        .compile_protos(&["proto/collector.proto"], &["proto"])?;

    println!("cargo:rerun-if-changed=proto/collector.proto");
    Ok(())
}
