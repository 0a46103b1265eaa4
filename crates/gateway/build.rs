fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_prost_build::configure()
        .build_server(false) // RVPS is only ever called, never served
        .build_client(true)
        .compile_protos(&["proto/reference.proto"], &["proto/"])?;
    Ok(())
}
