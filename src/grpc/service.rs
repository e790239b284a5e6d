//! Admission service implementation.

use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, instrument, warn};

use super::proto::guardian::v1::{
    admission_service_server::AdmissionService, evaluate_response::Code, EvaluateRequest,
    EvaluateResponse, ProvisionRequest, ProvisionResponse, ResetCycleRequest,
    ResetCycleResponse, UsageRequest, UsageResponse,
};

use crate::error::GuardianError;
use crate::quota::{AdmissionGate, QuotaLimits};

/// Implementation of the AdmissionService gRPC interface.
pub struct AdmissionServiceImpl<G: AdmissionGate> {
    /// The admission gate instance
    gate: Arc<G>,
}

impl<G: AdmissionGate> AdmissionServiceImpl<G> {
    /// Create a new AdmissionServiceImpl with the given gate.
    pub fn new(gate: Arc<G>) -> Self {
        Self { gate }
    }
}

/// Map an engine error onto a gRPC status.
///
/// Store failures become `INTERNAL` so callers can tell them apart from an
/// over-limit verdict.
fn to_status(err: GuardianError) -> Status {
    match err {
        GuardianError::InvalidRequest(msg) => {
            warn!(error = %msg, "Rejected invalid request");
            Status::invalid_argument(msg)
        }
        other => {
            error!(error = %other, "Admission check failed");
            Status::internal(format!("internal error: {}", other))
        }
    }
}

#[tonic::async_trait]
impl<G: AdmissionGate + 'static> AdmissionService for AdmissionServiceImpl<G> {
    /// Decide whether a request may proceed.
    #[instrument(
        skip(self, request),
        fields(
            token = %request.get_ref().token,
            request_bytes = request.get_ref().request_bytes
        )
    )]
    async fn evaluate(
        &self,
        request: Request<EvaluateRequest>,
    ) -> Result<Response<EvaluateResponse>, Status> {
        let req = request.into_inner();

        let admitted = self
            .gate
            .evaluate(&req.token, req.request_bytes)
            .await
            .map_err(to_status)?;

        let code = if admitted {
            Code::Ok
        } else {
            info!("Request rate limited");
            Code::OverLimit
        };
        debug!(code = ?code, "Admission decision made");

        Ok(Response::new(EvaluateResponse { code: code.into() }))
    }

    #[instrument(skip(self, _request))]
    async fn reset_cycle(
        &self,
        _request: Request<ResetCycleRequest>,
    ) -> Result<Response<ResetCycleResponse>, Status> {
        self.gate.reset_cycle().await.map_err(to_status)?;
        info!("Cycle reset on request");
        Ok(Response::new(ResetCycleResponse {}))
    }

    #[instrument(skip(self, request), fields(token = %request.get_ref().token))]
    async fn provision(
        &self,
        request: Request<ProvisionRequest>,
    ) -> Result<Response<ProvisionResponse>, Status> {
        let req = request.into_inner();
        let limits = QuotaLimits {
            request_quota: req.request_quota,
            traffic_quota: req.traffic_quota,
        };

        self.gate
            .provision(&req.token, limits)
            .await
            .map_err(to_status)?;
        Ok(Response::new(ProvisionResponse {}))
    }

    #[instrument(skip(self, request), fields(token = %request.get_ref().token))]
    async fn usage(
        &self,
        request: Request<UsageRequest>,
    ) -> Result<Response<UsageResponse>, Status> {
        let req = request.into_inner();
        let record = self.gate.usage(&req.token).await.map_err(to_status)?;

        Ok(Response::new(UsageResponse {
            request_quota: record.request_quota,
            request_count: record.request_count,
            traffic_quota: record.traffic_quota,
            traffic_bytes: record.traffic_bytes,
        }))
    }
}
