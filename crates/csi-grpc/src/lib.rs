//! Tonic bindings for the Container Storage Interface (CSI) v1, generated
//! from the vendored `vendor/csi.proto` at build time.

pub mod v1 {
    #![allow(clippy::all)]

    tonic::include_proto!("csi.v1");
}
