//! gRPC transport for the admission service.

mod server;
mod service;

pub use server::GrpcServer;
pub use service::AdmissionServiceImpl;

// Include the generated protobuf code
pub mod proto {
    pub mod guardian {
        pub mod v1 {
            tonic::include_proto!("guardian.v1");
        }
    }
}

// Re-export commonly used types
pub use proto::guardian::v1::{
    admission_service_client::AdmissionServiceClient,
    admission_service_server::AdmissionServiceServer,
    EvaluateRequest, EvaluateResponse,
};
