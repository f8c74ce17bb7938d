//! gRPC ingress: the `MetricService.Update` unary RPC and a trusted-subnet
//! interceptor that also logs each accepted request. Mirrors the HTTP
//! entrypoint's update semantics against the same use-case, with
//! RPC-appropriate status mapping ([`tonic::Code`] instead of HTTP status
//! codes).

use std::net::IpAddr;
use std::sync::Arc;

use std::net::SocketAddr;

use ipnet::IpNet;
use tonic::transport::server::Router;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::error::AppError;
use crate::metric::Metric;
use crate::usecase::MetricUseCase;

pub mod pb {
    tonic::include_proto!("mon");
}

use pb::metric_service_server::{MetricService, MetricServiceServer};
use pb::{MetricType, UpdateRequest, UpdateResponse};

pub struct MetricServiceImpl {
    usecase: Arc<MetricUseCase>,
}

impl MetricServiceImpl {
    pub fn new(usecase: Arc<MetricUseCase>) -> Self {
        Self { usecase }
    }

    fn to_domain(metrics: Vec<pb::Metric>) -> Result<Vec<Metric>, Status> {
        let mut out = Vec::with_capacity(metrics.len());
        for m in metrics {
            let kind = MetricType::try_from(m.r#type).map_err(|_| Status::invalid_argument("unknown metric type"))?;
            let metric = match kind {
                MetricType::Gauge if m.delta.is_none() && m.value.is_some() => {
                    Metric::Gauge { name: m.name, value: m.value.unwrap() }
                }
                MetricType::Counter if m.delta.is_some() && m.value.is_none() => {
                    Metric::Counter { name: m.name, delta: m.delta.unwrap() }
                }
                MetricType::Gauge | MetricType::Counter => {
                    return Err(Status::invalid_argument("invalid metric type"))
                }
                MetricType::Unknown => return Err(Status::invalid_argument("unknown metric type")),
            };
            out.push(metric);
        }
        Ok(out)
    }
}

#[tonic::async_trait]
impl MetricService for MetricServiceImpl {
    async fn update(&self, request: Request<UpdateRequest>) -> Result<Response<UpdateResponse>, Status> {
        let metrics = request.into_inner().metrics;
        if metrics.is_empty() {
            debug!("no metrics provided");
            return Err(Status::invalid_argument("no metrics provided"));
        }
        let metrics = Self::to_domain(metrics)?;
        self.usecase.update_batch(metrics).await.map_err(app_error_to_status)?;
        Ok(Response::new(UpdateResponse {}))
    }
}

fn app_error_to_status(err: AppError) -> Status {
    match err {
        AppError::Invalid(msg) => Status::invalid_argument(msg),
        AppError::NotFound => Status::not_found("not found"),
        AppError::UnsupportedMetricType => Status::invalid_argument("unsupported metric type"),
        AppError::Internal(msg) => Status::internal(msg),
        AppError::Transient(_) => Status::unavailable("transient storage error, retry"),
    }
}

/// Rejects requests whose `x-real-ip` metadata entry is missing, unparseable,
/// or outside the configured trusted subnet; logs each request that passes.
/// A no-op (but still logging) interceptor when no subnet is configured.
/// Runs ahead of the handler for every request, which is also what makes it
/// the right place for the access-log line: trusted-subnet rejection must
/// happen, and be logged, before the handler ever sees the request.
#[derive(Clone)]
pub struct TrustedSubnetInterceptor {
    subnet: Option<IpNet>,
}

impl TrustedSubnetInterceptor {
    pub fn new(subnet: Option<IpNet>) -> Self {
        Self { subnet }
    }
}

impl tonic::service::Interceptor for TrustedSubnetInterceptor {
    fn call(&mut self, req: Request<()>) -> Result<Request<()>, Status> {
        if let Some(subnet) = self.subnet {
            let Some(ip_value) = req.metadata().get("x-real-ip") else {
                debug!("trusted subnet: missing x-real-ip metadata");
                return Err(Status::permission_denied("missing IP-address"));
            };
            let ip_str = ip_value.to_str().map_err(|_| Status::permission_denied("invalid IP-address format"))?;
            let ip: IpAddr = ip_str.parse().map_err(|_| Status::permission_denied("invalid IP-address format"))?;
            if !subnet.contains(&ip) {
                debug!(ip = ip_str, subnet = %subnet, "trusted subnet: IP-address doesn't belong to the subnet");
                return Err(Status::permission_denied("IP-address doesn't belong to the subnet"));
            }
        }
        info!("rpc request accepted");
        Ok(req)
    }
}

/// Builds the RPC server stack: the `Update` service wrapped by the
/// trusted-subnet interceptor, which also logs each accepted request.
/// Panic recovery relies on tonic's per-request task isolation rather than
/// a `tower_http` layer here.
pub fn router(usecase: Arc<MetricUseCase>, trusted_subnet: Option<IpNet>) -> Router {
    let service = MetricServiceImpl::new(usecase);
    let interceptor = TrustedSubnetInterceptor::new(trusted_subnet);
    tonic::transport::Server::builder().add_service(MetricServiceServer::with_interceptor(service, interceptor))
}

pub async fn serve(router: Router, addr: SocketAddr, shutdown: impl std::future::Future<Output = ()>) -> anyhow::Result<()> {
    router.serve_with_shutdown(addr, shutdown).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn service() -> MetricServiceImpl {
        MetricServiceImpl::new(Arc::new(MetricUseCase::new(Arc::new(MemoryStorage::new()))))
    }

    #[tokio::test]
    async fn update_rejects_empty_batch() {
        let svc = service();
        let resp = svc.update(Request::new(UpdateRequest { metrics: vec![] })).await;
        assert_eq!(resp.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn update_applies_counter_and_gauge() {
        let svc = service();
        let req = UpdateRequest {
            metrics: vec![
                pb::Metric { name: "c".into(), r#type: MetricType::Counter as i32, delta: Some(3), value: None },
                pb::Metric { name: "g".into(), r#type: MetricType::Gauge as i32, delta: None, value: Some(1.5) },
            ],
        };
        svc.update(Request::new(req)).await.unwrap();
        let stored = svc.usecase.get(&crate::metric::MetricKey::new("c", crate::metric::MetricKind::Counter)).await.unwrap();
        assert_eq!(stored, Metric::Counter { name: "c".into(), delta: 3 });
    }

    #[tokio::test]
    async fn update_rejects_mismatched_type_and_payload() {
        let svc = service();
        let req = UpdateRequest {
            metrics: vec![pb::Metric { name: "c".into(), r#type: MetricType::Counter as i32, delta: None, value: Some(1.0) }],
        };
        let resp = svc.update(Request::new(req)).await;
        assert_eq!(resp.unwrap_err().code(), tonic::Code::InvalidArgument);
    }
}
