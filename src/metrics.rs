use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::Error;
use futures_util::future::LocalBoxFuture;
use prometheus::{histogram_opts, opts, Encoder, HistogramVec, IntCounterVec, Registry, TextEncoder};
use std::future::{ready, Ready};
use std::rc::Rc;
use std::time::Instant;

/// Request counters and latency, exported on `/oauth/metrics`.
///
/// Counters are lock-free atomics underneath; the registry is built once at
/// startup and shared by reference.
pub struct ProxyMetrics {
    registry: Registry,
    requests: IntCounterVec,
    latency: HistogramVec,
}

impl ProxyMetrics {
    pub fn new() -> Result<ProxyMetrics, prometheus::Error> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            opts!("http_request_total", "total number of requests handled"),
            &["method", "status"],
        )?;
        let latency = HistogramVec::new(
            histogram_opts!(
                "http_request_duration_seconds",
                "latency of handled requests"
            ),
            &["method"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        Ok(ProxyMetrics {
            registry,
            requests,
            latency,
        })
    }

    pub fn observe(&self, method: &str, status: u16, elapsed: f64) {
        self.requests
            .with_label_values(&[method, &status.to_string()])
            .inc();
        self.latency.with_label_values(&[method]).observe(elapsed);
    }

    pub fn export(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Middleware recording every request against [`ProxyMetrics`].
pub struct Measure;

impl<S, B> Transform<S, ServiceRequest> for Measure
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = MeasureMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(MeasureMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct MeasureMiddleware<S> {
    service: Rc<S>,
}

impl<S, B> Service<ServiceRequest> for MeasureMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        Box::pin(async move {
            let data = req
                .app_data::<actix_web::web::Data<crate::server::Gatekeeper>>()
                .cloned();
            let method = req.method().to_string();
            let start = Instant::now();
            let result = service.call(req).await;
            if let Some(data) = data {
                let status = match &result {
                    Ok(res) => res.status().as_u16(),
                    Err(err) => err.as_response_error().status_code().as_u16(),
                };
                data.metrics
                    .observe(&method, status, start.elapsed().as_secs_f64());
            }
            result.map(|res| res.map_into_left_body())
        })
    }
}
