use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use http::{Response, StatusCode};
use log::{debug, info, warn};
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorSource, ErrorType::*, Result};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};

use crate::{
    admin::AdminRouter,
    breaker::CircuitBreakers,
    core::{unix_now, GatewayError, RequestContext, ServiceContainer, Target},
    observability,
    pipeline::{GatewayRequest, Pipeline},
    proxy::{discovery, map_upstream_error, prepare_upstream_request},
    utils::response::ResponseBuilder,
};

/// Proxy service.
///
/// Runs the admission pipeline, answers gateway-local endpoints and forwards
/// everything else to the resolved upstream.
pub struct GatewayService {
    container: Arc<ServiceContainer>,
    admin: Arc<AdminRouter>,
    pipeline: Pipeline,
}

impl GatewayService {
    pub fn new(container: Arc<ServiceContainer>) -> Self {
        let admin = Arc::new(AdminRouter::new());
        let pipeline = Pipeline::standard(container.clone(), admin.clone());
        Self {
            container,
            admin,
            pipeline,
        }
    }

    /// Writes a locally generated response, annotated like a proxied one.
    async fn respond(
        &self,
        session: &mut Session,
        ctx: &RequestContext,
        response: Response<Vec<u8>>,
    ) -> Result<()> {
        let (mut header, body) = ResponseBuilder::into_proxy_response(response)?;
        self.pipeline.run_response(ctx, &mut header)?;
        ResponseBuilder::send_proxy_response(session, header, body).await
    }

    async fn respond_error(
        &self,
        session: &mut Session,
        ctx: &RequestContext,
        err: &GatewayError,
    ) -> Result<()> {
        let response = ResponseBuilder::error_json(err, &ctx.request_id);
        self.respond(session, ctx, response).await
    }

    async fn report_outcome(&self, ctx: &mut RequestContext, success: bool) {
        report_outcome_at(&self.container.breakers, ctx, success, unix_now()).await;
    }
}

/// What a failed proxy attempt means for the caller and the breaker.
#[derive(Debug, PartialEq)]
enum ProxyFailure {
    /// The downstream went away, nothing is left to answer
    Disconnected,
    /// Answer with `error`; `upstream` failures count against the breaker
    Respond { error: GatewayError, upstream: bool },
}

fn classify_failure(e: &Error, ctx: &RequestContext) -> ProxyFailure {
    match e.esource() {
        ErrorSource::Downstream => match e.etype() {
            WriteError | ReadError | ConnectionClosed => ProxyFailure::Disconnected,
            _ => ProxyFailure::Respond {
                error: GatewayError::Validation("Malformed request".to_string()),
                upstream: false,
            },
        },
        _ => match ctx.upstream.as_ref() {
            Some(entry) => ProxyFailure::Respond {
                error: map_upstream_error(&entry.service_id, e),
                upstream: true,
            },
            None => ProxyFailure::Respond {
                error: GatewayError::Internal("Internal error".to_string()),
                upstream: false,
            },
        },
    }
}

/// Upstream 5xx answers count as breaker failures, everything else as success.
fn is_upstream_success(status: StatusCode) -> bool {
    !status.is_server_error()
}

/// Reports the upstream outcome to the breaker, at most once per request.
/// Returns whether this call did the reporting.
async fn report_outcome_at(
    breakers: &CircuitBreakers,
    ctx: &mut RequestContext,
    success: bool,
    now: f64,
) -> bool {
    if ctx.outcome_reported {
        return false;
    }
    let (Some(admission), Some(service_id)) = (ctx.admission, ctx.service_id()) else {
        return false;
    };
    let service_id = service_id.to_string();
    ctx.outcome_reported = true;

    if let Err(e) = breakers.record_at(&service_id, admission, success, now).await {
        warn!("Failed to record outcome for '{service_id}': {e}");
    }
    true
}

async fn read_request_body(session: &mut Session) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    while let Some(bytes) = session.read_request_body().await? {
        body.extend_from_slice(&bytes);
    }
    Ok(body)
}

#[async_trait]
impl ProxyHttp for GatewayService {
    type CTX = RequestContext;

    fn new_ctx(&self) -> Self::CTX {
        Self::CTX::default()
    }

    /// Runs the inbound pipeline. Rejections and local endpoints are
    /// answered here and never reach an upstream.
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let request = GatewayRequest::from_session(session, &self.container.gateway);

        if let Err(err) = self.pipeline.run_request(&request, ctx).await {
            self.respond_error(session, ctx, &err).await?;
            return Ok(true);
        }

        if ctx.target == Target::Local {
            let body = read_request_body(session).await?;
            let response = match self.admin.dispatch(&self.container, &request, &body).await {
                Ok(response) => response,
                Err(err) => {
                    debug!("Request {} failed locally: {err}", ctx.request_id);
                    ResponseBuilder::error_json(&err, &ctx.request_id)
                }
            };
            self.respond(session, ctx, response).await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let Some(entry) = ctx.upstream.clone() else {
            return Error::e_explain(InternalError, "No upstream resolved for request");
        };

        let addr = discovery::resolve(&entry.host, entry.port).await?;
        ctx.upstream_started = Some(Instant::now());
        Ok(Box::new(entry.peer(addr)))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let (Some(entry), Target::Service { path, .. }) = (ctx.upstream.as_ref(), &ctx.target)
        else {
            return Error::e_explain(InternalError, "Upstream request without a service target");
        };

        let query = upstream_request.uri.query().map(str::to_string);
        prepare_upstream_request(upstream_request, entry, path, query.as_deref())
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        self.pipeline.run_response(ctx, upstream_response)?;

        let success = is_upstream_success(upstream_response.status);
        self.report_outcome(ctx, success).await;
        Ok(())
    }

    /// Maps transport failures onto the gateway error body.
    async fn fail_to_proxy(&self, session: &mut Session, e: &Error, ctx: &mut Self::CTX) -> u16
    where
        Self::CTX: Send,
    {
        let err = match classify_failure(e, ctx) {
            ProxyFailure::Disconnected => return 0,
            ProxyFailure::Respond { error, upstream } => {
                if upstream {
                    warn!("Request {} failed upstream: {e}", ctx.request_id);
                    self.report_outcome(ctx, false).await;
                }
                error
            }
        };

        let code = err.status().as_u16();
        if let Err(write_err) = self.respond_error(session, ctx, &err).await {
            debug!("Unable to send error response: {write_err}");
        }
        code
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let code = session
            .response_written()
            .map_or(0, |resp| resp.status.as_u16());
        observability::record_request(code);

        if let (Some(entry), Some(started)) = (ctx.upstream.as_ref(), ctx.upstream_started) {
            let label = if e.is_some() {
                String::new()
            } else {
                code.to_string()
            };
            observability::record_upstream(
                &entry.service_id,
                &label,
                started.elapsed().as_secs_f64() * 1000.0,
            );
        }

        // a probe that never produced a response must still free the breaker
        if e.is_some() {
            self.report_outcome(ctx, false).await;
        }

        let req = session.req_header();
        info!(
            "{} {} {} {} {}ms",
            ctx.request_id,
            req.method,
            req.uri,
            code,
            ctx.request_start.elapsed().as_millis()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        breaker::{Admission, CircuitState},
        config::Config,
    };

    fn container() -> Arc<ServiceContainer> {
        let conf = Config::from_yaml(
            r#"
gateway:
  listeners:
    - address: 0.0.0.0:8080
  circuit_breaker:
    failure_threshold: 1
    cooldown_seconds: 30
services:
  - id: users
    base_url: http://127.0.0.1:9001
"#,
        )
        .unwrap();
        Arc::new(ServiceContainer::from_config(&conf).unwrap())
    }

    fn routed_ctx(container: &ServiceContainer) -> RequestContext {
        RequestContext {
            target: Target::Service {
                service_id: "users".to_string(),
                path: "me".to_string(),
            },
            upstream: Some(container.registry.resolve("users").unwrap()),
            ..Default::default()
        }
    }

    fn respond_status(failure: ProxyFailure) -> (u16, bool) {
        match failure {
            ProxyFailure::Respond { error, upstream } => (error.status().as_u16(), upstream),
            ProxyFailure::Disconnected => panic!("expected a response"),
        }
    }

    #[test]
    fn test_new_ctx_has_request_id() {
        let service = GatewayService::new(container());

        let a = service.new_ctx();
        let b = service.new_ctx();
        assert!(!a.request_id.is_empty());
        assert_ne!(a.request_id, b.request_id);
        assert!(a.upstream.is_none());
        assert_eq!(7, service.pipeline.stage_names().len());
    }

    #[test]
    fn test_upstream_failures_map_to_gateway_errors() {
        let container = container();
        let ctx = routed_ctx(&container);

        for etype in [ReadTimedout, ConnectTimedout, WriteTimedout] {
            assert_eq!(
                (504, true),
                respond_status(classify_failure(&Error::new_up(etype), &ctx))
            );
        }
        for etype in [ConnectRefused, ConnectionClosed, InvalidHTTPHeader] {
            assert_eq!(
                (502, true),
                respond_status(classify_failure(&Error::new_up(etype), &ctx))
            );
        }
    }

    #[test]
    fn test_downstream_and_internal_failures() {
        let container = container();
        let ctx = routed_ctx(&container);

        for etype in [WriteError, ReadError, ConnectionClosed] {
            assert_eq!(
                ProxyFailure::Disconnected,
                classify_failure(&Error::new_down(etype), &ctx)
            );
        }
        assert_eq!(
            (400, false),
            respond_status(classify_failure(&Error::new_down(InvalidHTTPHeader), &ctx))
        );

        let unrouted = RequestContext::default();
        assert_eq!(
            (500, false),
            respond_status(classify_failure(&Error::new_up(ConnectRefused), &unrouted))
        );
    }

    #[test]
    fn test_only_server_errors_fail_the_breaker() {
        for code in [200, 204, 301, 404, 429] {
            assert!(is_upstream_success(StatusCode::from_u16(code).unwrap()), "{code}");
        }
        for code in [500, 502, 503, 504] {
            assert!(!is_upstream_success(StatusCode::from_u16(code).unwrap()), "{code}");
        }
    }

    #[tokio::test]
    async fn test_failed_half_open_trial_reopens_breaker() {
        let container = container();
        let breakers = &container.breakers;
        breakers
            .record_at("users", Admission::Normal, false, 100.0)
            .await
            .unwrap();

        let mut ctx = routed_ctx(&container);
        ctx.admission = Some(breakers.acquire_at("users", 131.0).await.unwrap());
        assert_eq!(Some(Admission::Probe), ctx.admission);

        // the trial request times out upstream
        let (code, upstream) =
            respond_status(classify_failure(&Error::new_up(ReadTimedout), &ctx));
        assert_eq!((504, true), (code, upstream));
        assert!(report_outcome_at(breakers, &mut ctx, false, 131.5).await);
        // the logging hook reporting again changes nothing
        assert!(!report_outcome_at(breakers, &mut ctx, false, 131.6).await);

        let status = breakers.status_at("users", 132.0).await.unwrap();
        assert_eq!(CircuitState::Open, status.state);
        assert_eq!(Some(161.5), status.next_attempt);

        let err = breakers.acquire_at("users", 140.0).await.unwrap_err();
        assert_eq!(503, err.status().as_u16());
    }

    #[tokio::test]
    async fn test_successful_half_open_trial_closes_breaker() {
        let container = container();
        let breakers = &container.breakers;
        breakers
            .record_at("users", Admission::Normal, false, 100.0)
            .await
            .unwrap();

        let mut ctx = routed_ctx(&container);
        ctx.admission = Some(breakers.acquire_at("users", 130.0).await.unwrap());
        let success = is_upstream_success(StatusCode::OK);
        assert!(report_outcome_at(breakers, &mut ctx, success, 130.2).await);

        let status = breakers.status_at("users", 130.3).await.unwrap();
        assert_eq!(CircuitState::Closed, status.state);
        assert_eq!(0, status.failure_count);
    }

    #[tokio::test]
    async fn test_unadmitted_request_reports_nothing() {
        let container = container();
        let mut ctx = routed_ctx(&container);
        assert!(!report_outcome_at(&container.breakers, &mut ctx, false, 10.0).await);
        assert!(!ctx.outcome_reported);
    }
}
