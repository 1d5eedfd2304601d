//! Generated bindings for the `mesh.v1.MediaProxyControl` gRPC service.
//! Compiled from `proto/mesh_control.proto` by `tonic-prost-build` at build
//! time; see `build.rs`.

pub mod mesh_v1 {
    tonic::include_proto!("mesh.v1");
}

pub use mesh_v1::*;
