//! Axum integration utilities.

use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::audit::{AuditSink, NoAudit};
use crate::cache::{Cache, NoCache};
use crate::engine::{Authorization, Engine};
use crate::error::{Error, ErrorKind};
use crate::permission::Permission;
use crate::store::Store;
use crate::types::{OrganizationId, PrincipalId};

use ::axum::body::Body;
use ::axum::extract::FromRequestParts;
use ::axum::response::{IntoResponse, Response};
use ::http::request::Parts;
use ::http::{Request, StatusCode};
use ::tower::{Layer, Service};

/// Authentication context attached to a request by an upstream layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub organization: OrganizationId,
    pub principal: PrincipalId,
}

impl AuthContext {
    pub fn new(organization: OrganizationId, principal: PrincipalId) -> Self {
        Self {
            organization,
            principal,
        }
    }
}

impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthContext>()
            .cloned()
            .ok_or_else(|| Error::InvalidToken("missing auth context".to_string()))
    }
}

/// HTTP status for an error kind.
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorKind::Infrastructure => StatusCode::SERVICE_UNAVAILABLE,
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = status_for(self.kind());
        // Infrastructure details stay in the logs.
        let message = match self.kind() {
            ErrorKind::Infrastructure => "service unavailable".to_string(),
            _ => self.to_string(),
        };
        (status, message).into_response()
    }
}

impl IntoResponse for Authorization {
    fn into_response(self) -> Response {
        match self {
            Authorization::Allowed { .. } => StatusCode::NO_CONTENT.into_response(),
            Authorization::Denied { reason } => (StatusCode::FORBIDDEN, reason).into_response(),
            Authorization::Undetermined { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "authorization undetermined").into_response()
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Requirement {
    Fixed(Permission),
    Endpoint,
}

/// Middleware layer that authorizes a request using [`Engine`].
///
/// Expects an [`AuthContext`] in the request extensions.
pub struct AuthorizeLayer<S, C = NoCache, A = NoAudit> {
    engine: Arc<Engine<S, C, A>>,
    requirement: Requirement,
}

impl<S, C, A> Clone for AuthorizeLayer<S, C, A> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            requirement: self.requirement.clone(),
        }
    }
}

impl<S, C, A> AuthorizeLayer<S, C, A> {
    /// Requires one fixed permission.
    pub fn new(engine: Arc<Engine<S, C, A>>, permission: Permission) -> Self {
        Self {
            engine,
            requirement: Requirement::Fixed(permission),
        }
    }

    /// Derives the permission from method and path, see
    /// [`Permission::from_endpoint`].
    pub fn for_endpoints(engine: Arc<Engine<S, C, A>>) -> Self {
        Self {
            engine,
            requirement: Requirement::Endpoint,
        }
    }
}

impl<S, C, A, Inner> Layer<Inner> for AuthorizeLayer<S, C, A>
where
    S: Store,
    C: Cache,
    A: AuditSink,
{
    type Service = AuthorizeService<Inner, S, C, A>;

    fn layer(&self, inner: Inner) -> Self::Service {
        AuthorizeService {
            inner,
            engine: self.engine.clone(),
            requirement: self.requirement.clone(),
        }
    }
}

/// Middleware service that enforces permission checks.
pub struct AuthorizeService<Inner, S, C = NoCache, A = NoAudit> {
    inner: Inner,
    engine: Arc<Engine<S, C, A>>,
    requirement: Requirement,
}

impl<Inner: Clone, S, C, A> Clone for AuthorizeService<Inner, S, C, A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            engine: self.engine.clone(),
            requirement: self.requirement.clone(),
        }
    }
}

impl<Inner, S, C, A> Service<Request<Body>> for AuthorizeService<Inner, S, C, A>
where
    Inner: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    Inner::Future: Send + 'static,
    S: Store + 'static,
    C: Cache + 'static,
    A: AuditSink + 'static,
{
    type Response = Response;
    type Error = Inner::Error;
    type Future = Pin<Box<dyn std::future::Future<Output = Result<Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let engine = self.engine.clone();
        let requirement = self.requirement.clone();

        Box::pin(async move {
            let context = req.extensions().get::<AuthContext>().cloned();
            let Some(context) = context else {
                return Ok((StatusCode::UNAUTHORIZED, "missing auth context").into_response());
            };

            let outcome = match &requirement {
                Requirement::Fixed(permission) => {
                    engine
                        .authorize(&context.principal, &context.organization, permission)
                        .await
                }
                Requirement::Endpoint => {
                    let method = req.method().as_str().to_string();
                    let path = req.uri().path().to_string();
                    engine
                        .authorize_endpoint(
                            &context.principal,
                            &context.organization,
                            &method,
                            &path,
                        )
                        .await
                }
            };

            match outcome {
                Authorization::Allowed { .. } => {
                    poll_fn(|cx| inner.poll_ready(cx)).await?;
                    inner.call(req).await
                }
                denied => Ok(denied.into_response()),
            }
        })
    }
}

#[cfg(feature = "axum-session")]
pub mod session {
    //! Bearer session tokens for axum.

    use std::future::poll_fn;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};

    use crate::axum::AuthContext;
    use crate::error::Error;
    use crate::session::{AccessToken, TokenCodec};
    use crate::types::OrganizationId;

    use ::axum::body::Body;
    use ::axum::extract::FromRequestParts;
    use ::axum::response::{IntoResponse, Response};
    use ::http::header::AUTHORIZATION;
    use ::http::request::Parts;
    use ::http::{HeaderMap, Request};
    use ::tower::{Layer, Service};

    /// Header naming the organization a request acts in.
    pub const ORGANIZATION_HEADER: &str = "x-organization-id";

    impl<S> FromRequestParts<S> for AccessToken
    where
        S: Send + Sync,
    {
        type Rejection = Error;

        async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
            parts
                .extensions
                .get::<AccessToken>()
                .cloned()
                .ok_or_else(|| Error::InvalidToken("missing session token".to_string()))
        }
    }

    /// Decodes the bearer token, then inserts [`AccessToken`] and, when the
    /// organization header names an organization the token can access,
    /// [`AuthContext`].
    #[derive(Debug, Clone)]
    pub struct SessionLayer {
        codec: Arc<TokenCodec>,
    }

    impl SessionLayer {
        pub fn new(codec: Arc<TokenCodec>) -> Self {
            Self { codec }
        }
    }

    impl<S> Layer<S> for SessionLayer {
        type Service = SessionService<S>;

        fn layer(&self, inner: S) -> Self::Service {
            SessionService {
                inner,
                codec: self.codec.clone(),
            }
        }
    }

    #[derive(Debug, Clone)]
    pub struct SessionService<S> {
        inner: S,
        codec: Arc<TokenCodec>,
    }

    impl<S> Service<Request<Body>> for SessionService<S>
    where
        S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
        S::Future: Send + 'static,
    {
        type Response = Response;
        type Error = S::Error;
        type Future =
            Pin<Box<dyn std::future::Future<Output = Result<Response, Self::Error>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, mut req: Request<Body>) -> Self::Future {
            let codec = self.codec.clone();
            let mut inner = self.inner.clone();

            Box::pin(async move {
                let token = match bearer_token(req.headers())
                    .and_then(|token| codec.validate_access(&token))
                {
                    Ok(token) => token,
                    Err(err) => return Ok(err.into_response()),
                };
                if let Some(organization) = organization_header(req.headers())
                    && token.context().has_organization_access(&organization)
                {
                    let context = AuthContext::new(organization, token.principal().clone());
                    req.extensions_mut().insert(context);
                }
                req.extensions_mut().insert(token);
                poll_fn(|cx| inner.poll_ready(cx)).await?;
                inner.call(req).await
            })
        }
    }

    fn organization_header(headers: &HeaderMap) -> Option<OrganizationId> {
        headers
            .get(ORGANIZATION_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| OrganizationId::new(value).ok())
    }

    /// Extracts the token from `Authorization: Bearer <token>`.
    pub fn bearer_token(headers: &HeaderMap) -> Result<String, Error> {
        let value = headers
            .get(AUTHORIZATION)
            .ok_or_else(|| Error::InvalidToken("missing authorization header".to_string()))?;
        let value = value
            .to_str()
            .map_err(|_| Error::InvalidToken("invalid authorization header".to_string()))?;
        let token = value
            .strip_prefix("Bearer ")
            .ok_or_else(|| Error::InvalidToken("invalid authorization header".to_string()))?;
        if token.is_empty() {
            return Err(Error::InvalidToken("empty bearer token".to_string()));
        }
        Ok(token.to_string())
    }

}

#[cfg(all(test, feature = "memory-store"))]
mod tests {
    use super::*;
    use crate::engine::EngineBuilder;
    use crate::memory_store::MemoryStore;
    use crate::model::{RoleScope, TimeWindow};
    use crate::types::Principal;
    use futures::executor::block_on;
    use std::convert::Infallible;
    use std::future::{Ready, ready};

    #[derive(Clone)]
    struct Ok200;

    impl Service<Request<Body>> for Ok200 {
        type Response = Response;
        type Error = Infallible;
        type Future = Ready<Result<Response, Infallible>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _req: Request<Body>) -> Self::Future {
            ready(Ok(StatusCode::OK.into_response()))
        }
    }

    fn request(path: &str, context: Option<AuthContext>) -> Request<Body> {
        let mut req = Request::builder()
            .method("GET")
            .uri(path)
            .body(Body::empty())
            .unwrap();
        if let Some(context) = context {
            req.extensions_mut().insert(context);
        }
        req
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(
            Error::Conflict("dup".into()).into_response().status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            Error::not_found("group", "g1").into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::Validation("bad".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::Timeout { operation: "load role" }.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::InvalidToken("expired".into()).into_response().status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn authorize_layer_maps_outcomes() {
        let store = MemoryStore::new();
        let engine = Arc::new(EngineBuilder::new(store.clone()).build());
        let admin = PrincipalId::try_from("admin").unwrap();
        let org = block_on(engine.create_organization(&admin, "Acme", "company", None)).unwrap();
        let group = block_on(engine.create_group(&admin, &org.id, "Eng", None)).unwrap();
        let role = block_on(engine.create_role(&admin, "reader", RoleScope::Global)).unwrap();
        let record = block_on(engine.create_permission(
            &admin,
            Permission::try_from("users:read").unwrap(),
            None,
        ))
        .unwrap();
        block_on(engine.assign_permission(&admin, &role.id, &record.id)).unwrap();
        block_on(engine.assign_role_to_group(&admin, &group.id, &role.id, TimeWindow::always()))
            .unwrap();
        let u1 = Principal::user(PrincipalId::try_from("u1").unwrap());
        block_on(engine.add_group_member(&admin, &group.id, &u1, TimeWindow::always())).unwrap();

        let context = AuthContext::new(org.id.clone(), u1.id.clone());
        let mut service = AuthorizeLayer::for_endpoints(engine.clone()).layer(Ok200);

        let response = block_on(service.call(request("/api/v1/users", Some(context.clone())))).unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = block_on(service.call(request("/orders", Some(context.clone())))).unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = block_on(service.call(request("/users", None))).unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        store.set_unavailable(true);
        let response = block_on(service.call(request("/users", Some(context)))).unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
