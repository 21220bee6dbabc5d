use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use the vendored protoc so builds do not depend on a system install.
    std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);

    // The vendored include path provides the google.protobuf well-known
    // types imported by csi.proto.
    let well_known_types = protoc_bin_vendored::include_path()?;
    let includes = [Path::new("vendor"), well_known_types.as_path()];

    tonic_build::configure()
        .build_client(false)
        .compile_protos(&[Path::new("vendor/csi.proto")], &includes)?;

    println!("cargo:rerun-if-changed=vendor/csi.proto");
    Ok(())
}
