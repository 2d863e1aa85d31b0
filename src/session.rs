//! Session context assembly and signed session tokens.
//!
//! The assembler resolves a principal across every organization it belongs
//! to and embeds the result in an access token. Predicates on the decoded
//! context are advisory; use [`SessionAssembler::reverify`] for high-value
//! operations.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::audit::{AuditSink, NoAudit};
use crate::cache::{Cache, NoCache};
use crate::engine::{Authorization, Deadline, Engine};
use crate::error::{Error, Result};
use crate::permission::{Permission, permission_matches};
use crate::resolver::EffectivePermissions;
use crate::store::Store;
use crate::types::{
    GroupId, OrganizationId, Principal, PrincipalId, PrincipalType, RoleId, SessionId, TokenId,
};

/// HMAC key with its key id.
#[derive(Clone)]
pub struct SigningKey {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl SigningKey {
    /// HS256 key from a shared secret.
    pub fn hmac(kid: impl Into<String>, secret: impl AsRef<[u8]>) -> Self {
        let secret = secret.as_ref();
        Self {
            kid: kid.into(),
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("kid", &self.kid)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Active signing key plus every key still trusted for verification.
#[derive(Clone)]
pub struct SigningKeys {
    active: SigningKey,
    verification: HashMap<String, DecodingKey>,
}

impl SigningKeys {
    pub fn new(active: SigningKey) -> Self {
        let mut verification = HashMap::new();
        verification.insert(active.kid.clone(), active.decoding.clone());
        Self {
            active,
            verification,
        }
    }

    /// Trusts an additional key for verification only.
    pub fn trust(mut self, key: SigningKey) -> Self {
        self.verification.insert(key.kid, key.decoding);
        self
    }

    /// Signs with `next` from now on; the previous key keeps verifying.
    pub fn rotate(&mut self, next: SigningKey) {
        self.verification
            .insert(next.kid.clone(), next.decoding.clone());
        self.active = next;
    }

    /// Stops trusting a key. The active key cannot be retired.
    pub fn retire(&mut self, kid: &str) -> bool {
        if kid == self.active.kid {
            return false;
        }
        self.verification.remove(kid).is_some()
    }

    pub fn active_kid(&self) -> &str {
        &self.active.kid
    }

    /// Trusted key ids, sorted.
    pub fn trusted_kids(&self) -> Vec<&str> {
        let mut kids: Vec<&str> = self.verification.keys().map(String::as_str).collect();
        kids.sort_unstable();
        kids
    }

    fn decoding(&self, kid: &str) -> Option<&DecodingKey> {
        self.verification.get(kid)
    }
}

impl fmt::Debug for SigningKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeys")
            .field("active", &self.active.kid)
            .field("trusted", &self.trusted_kids())
            .finish()
    }
}

/// Token lifetimes and versioning.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub issuer: String,
    pub access_ttl_secs: u64,
    pub refresh_ttl_secs: u64,
    /// Tokens carrying another version are rejected; bump to revoke all.
    pub token_version: u32,
    pub leeway_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            issuer: "rs-orgauthz".to_string(),
            access_ttl_secs: 15 * 60,
            refresh_ttl_secs: 7 * 24 * 60 * 60,
            token_version: 1,
            leeway_secs: 30,
        }
    }
}

impl SessionConfig {
    fn access_ttl(&self) -> Duration {
        Duration::seconds(i64::try_from(self.access_ttl_secs).unwrap_or(i64::MAX / 1000))
    }

    fn refresh_ttl(&self) -> Duration {
        Duration::seconds(i64::try_from(self.refresh_ttl_secs).unwrap_or(i64::MAX / 1000))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganizationClaim {
    pub id: OrganizationId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupClaim {
    pub id: GroupId,
    pub name: String,
    pub organization_id: OrganizationId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleClaim {
    pub id: RoleId,
    pub name: String,
    /// `global`, `organization` or `group`.
    pub scope: String,
    pub organization_id: Option<OrganizationId>,
    pub group_id: Option<GroupId>,
    pub is_active: bool,
}

/// Authorization snapshot embedded in access tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    pub principal_id: PrincipalId,
    pub principal_type: PrincipalType,
    pub organizations: Vec<OrganizationClaim>,
    pub groups: Vec<GroupClaim>,
    pub roles: Vec<RoleClaim>,
    pub permissions: Vec<String>,
    pub scopes: Vec<String>,
}

impl SessionContext {
    /// Whether the snapshot carries a permission satisfying `required`.
    pub fn has_permission(&self, required: &Permission) -> bool {
        self.permissions.iter().any(|granted| {
            Permission::new(granted)
                .is_ok_and(|granted| permission_matches(&granted, required, true))
        })
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|candidate| candidate == scope)
    }

    pub fn has_organization_access(&self, organization: &OrganizationId) -> bool {
        self.organizations.iter().any(|claim| &claim.id == organization)
    }

    pub fn has_group_access(&self, group: &GroupId) -> bool {
        self.groups.iter().any(|claim| &claim.id == group)
    }

    pub fn has_role(&self, name: &str) -> bool {
        self.roles.iter().any(|role| role.name == name)
    }

    pub fn has_active_role(&self, name: &str) -> bool {
        self.roles.iter().any(|role| role.name == name && role.is_active)
    }

    pub fn organization_ids(&self) -> Vec<&OrganizationId> {
        self.organizations.iter().map(|claim| &claim.id).collect()
    }

    pub fn group_ids(&self) -> Vec<&GroupId> {
        self.groups.iter().map(|claim| &claim.id).collect()
    }
}

/// Access token payload: metadata plus the full session context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: PrincipalId,
    pub jti: TokenId,
    pub sid: SessionId,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub ver: u32,
    pub typ: TokenType,
    #[serde(flatten)]
    pub context: SessionContext,
}

/// Refresh token payload. Never carries roles or permissions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub sub: PrincipalId,
    pub pty: PrincipalType,
    pub jti: TokenId,
    pub sid: SessionId,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub ver: u32,
    pub typ: TokenType,
}

#[derive(Deserialize)]
struct TypeHeader {
    typ: TokenType,
}

/// Decoded, verified access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub claims: AccessClaims,
}

impl AccessToken {
    pub fn context(&self) -> &SessionContext {
        &self.claims.context
    }

    pub fn principal(&self) -> &PrincipalId {
        &self.claims.sub
    }

    pub fn session_id(&self) -> &SessionId {
        &self.claims.sid
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.claims.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at() <= Utc::now()
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        (self.expires_at() - Utc::now()).max(Duration::zero())
    }
}

/// Result of [`TokenCodec::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidatedToken {
    Access(AccessToken),
    Refresh(RefreshClaims),
}

/// Freshly issued access/refresh pair.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub session_id: SessionId,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub context: SessionContext,
}

/// Signs and verifies session tokens with rotating keys.
#[derive(Debug)]
pub struct TokenCodec {
    keys: RwLock<SigningKeys>,
    config: SessionConfig,
}

impl TokenCodec {
    pub fn new(keys: SigningKeys, config: SessionConfig) -> Self {
        Self {
            keys: RwLock::new(keys),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// See [`SigningKeys::rotate`].
    pub fn rotate(&self, next: SigningKey) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .rotate(next);
    }

    /// See [`SigningKeys::retire`].
    pub fn retire(&self, kid: &str) -> bool {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retire(kid)
    }

    pub fn active_kid(&self) -> String {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .active_kid()
            .to_string()
    }

    /// Signs claims with the active key, naming it in the header.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String> {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(keys.active.kid.clone());
        encode(&header, claims, &keys.active.encoding)
            .map_err(|err| Error::InvalidToken(format!("could not sign token: {err}")))
    }

    /// Verifies signature, expiry, issuer and version, then decodes by type.
    pub fn validate(&self, token: &str) -> Result<ValidatedToken> {
        let header: TypeHeader = self.verify(token)?;
        match header.typ {
            TokenType::Access => {
                let claims: AccessClaims = self.verify(token)?;
                self.check_version(claims.ver)?;
                Ok(ValidatedToken::Access(AccessToken { claims }))
            }
            TokenType::Refresh => {
                let claims: RefreshClaims = self.verify(token)?;
                self.check_version(claims.ver)?;
                Ok(ValidatedToken::Refresh(claims))
            }
        }
    }

    pub fn validate_access(&self, token: &str) -> Result<AccessToken> {
        match self.validate(token)? {
            ValidatedToken::Access(access) => Ok(access),
            ValidatedToken::Refresh(_) => Err(Error::InvalidToken(
                "expected an access token".to_string(),
            )),
        }
    }

    pub fn validate_refresh(&self, token: &str) -> Result<RefreshClaims> {
        match self.validate(token)? {
            ValidatedToken::Refresh(claims) => Ok(claims),
            ValidatedToken::Access(_) => Err(Error::InvalidToken(
                "expected a refresh token".to_string(),
            )),
        }
    }

    fn verify<T: DeserializeOwned>(&self, token: &str) -> Result<T> {
        let header = decode_header(token).map_err(jwt_error)?;
        let kid = header
            .kid
            .ok_or_else(|| Error::InvalidToken("token header has no key id".to_string()))?;
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let key = keys
            .decoding(&kid)
            .ok_or_else(|| Error::UnknownSigningKey(kid.clone()))?;
        decode::<T>(token, key, &self.validation())
            .map(|data| data.claims)
            .map_err(jwt_error)
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = self.config.leeway_secs;
        validation.set_issuer(&[self.config.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);
        validation
    }

    fn check_version(&self, version: u32) -> Result<()> {
        if version != self.config.token_version {
            return Err(Error::InvalidToken(format!(
                "token version {version} is no longer accepted"
            )));
        }
        Ok(())
    }
}

fn jwt_error(err: jsonwebtoken::errors::Error) -> Error {
    match err.kind() {
        JwtErrorKind::ExpiredSignature => Error::InvalidToken("token expired".to_string()),
        JwtErrorKind::InvalidSignature => Error::InvalidToken("bad signature".to_string()),
        _ => Error::InvalidToken(err.to_string()),
    }
}

/// Builds session contexts through the engine and mints tokens for them.
pub struct SessionAssembler<S, C = NoCache, A = NoAudit> {
    engine: Arc<Engine<S, C, A>>,
    codec: Arc<TokenCodec>,
}

impl<S, C, A> SessionAssembler<S, C, A>
where
    S: Store,
    C: Cache,
    A: AuditSink,
{
    pub fn new(engine: Arc<Engine<S, C, A>>, codec: Arc<TokenCodec>) -> Self {
        Self { engine, codec }
    }

    pub fn codec(&self) -> &Arc<TokenCodec> {
        &self.codec
    }

    pub fn engine(&self) -> &Arc<Engine<S, C, A>> {
        &self.engine
    }

    /// Resolves the principal globally and in every organization it reaches.
    pub async fn assemble(&self, principal: &Principal) -> Result<SessionContext> {
        self.assemble_within(principal, self.engine.deadline()).await
    }

    async fn assemble_within(
        &self,
        principal: &Principal,
        deadline: Deadline,
    ) -> Result<SessionContext> {
        let organizations = self
            .engine
            .principal_organizations_within(&principal.id, deadline)
            .await?;
        let groups = self
            .engine
            .principal_groups_within(&principal.id, deadline)
            .await?;

        let mut roles = BTreeMap::new();
        let mut permissions = BTreeSet::new();
        let global = self
            .engine
            .effective_permissions_within(&principal.id, None, None, deadline)
            .await?;
        collect(&global, &mut roles, &mut permissions);
        for organization in &organizations {
            let effective = self
                .engine
                .effective_permissions_within(&principal.id, Some(&organization.id), None, deadline)
                .await?;
            collect(&effective, &mut roles, &mut permissions);
        }

        let mut scopes = BTreeSet::new();
        scopes.extend(roles.values().map(|role: &RoleClaim| format!("role:{}", role.name)));
        scopes.extend(organizations.iter().map(|org| format!("org:{}", org.id)));
        scopes.extend(groups.iter().map(|group| format!("group:{}", group.id)));

        debug!(
            principal = %principal.id,
            organizations = organizations.len(),
            roles = roles.len(),
            permissions = permissions.len(),
            "session context assembled"
        );

        Ok(SessionContext {
            principal_id: principal.id.clone(),
            principal_type: principal.kind,
            organizations: organizations
                .into_iter()
                .map(|org| OrganizationClaim {
                    id: org.id,
                    name: org.name,
                })
                .collect(),
            groups: groups
                .into_iter()
                .map(|group| GroupClaim {
                    id: group.id,
                    name: group.name,
                    organization_id: group.organization_id,
                })
                .collect(),
            roles: roles.into_values().collect(),
            permissions: permissions.into_iter().collect(),
            scopes: scopes.into_iter().collect(),
        })
    }

    /// Assembles a fresh context and issues an access/refresh pair.
    ///
    /// Passing `session` keeps an existing session id (refresh).
    pub async fn issue(&self, principal: &Principal, session: Option<SessionId>) -> Result<TokenPair> {
        let deadline = self.engine.deadline();
        let result = self.try_issue(principal, session, deadline).await;
        let session_id = result
            .as_ref()
            .map(|pair| pair.session_id.to_string())
            .unwrap_or_default();
        self.engine
            .record_mutation(
                deadline,
                &principal.id,
                "session.issue",
                "session",
                &session_id,
                &result,
                &[("principal_type", principal.kind.to_string())],
            )
            .await;
        result
    }

    async fn try_issue(
        &self,
        principal: &Principal,
        session: Option<SessionId>,
        deadline: Deadline,
    ) -> Result<TokenPair> {
        let context = self.assemble_within(principal, deadline).await?;
        let config = self.codec.config();
        let now = Utc::now();
        let session_id = session.unwrap_or_else(SessionId::generate);
        let access_expires_at = now + config.access_ttl();
        let refresh_expires_at = now + config.refresh_ttl();

        let access = AccessClaims {
            sub: principal.id.clone(),
            jti: TokenId::generate(),
            sid: session_id.clone(),
            iss: config.issuer.clone(),
            iat: now.timestamp(),
            exp: access_expires_at.timestamp(),
            ver: config.token_version,
            typ: TokenType::Access,
            context: context.clone(),
        };
        let refresh = RefreshClaims {
            sub: principal.id.clone(),
            pty: principal.kind,
            jti: TokenId::generate(),
            sid: session_id.clone(),
            iss: config.issuer.clone(),
            iat: now.timestamp(),
            exp: refresh_expires_at.timestamp(),
            ver: config.token_version,
            typ: TokenType::Refresh,
        };

        Ok(TokenPair {
            access_token: self.codec.sign(&access)?,
            refresh_token: self.codec.sign(&refresh)?,
            session_id,
            access_expires_at,
            refresh_expires_at,
            context,
        })
    }

    /// Exchanges a refresh token for a new pair in the same session.
    ///
    /// The context is re-assembled, never copied from the previous token.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.codec.validate_refresh(refresh_token)?;
        let principal = Principal {
            id: claims.sub,
            kind: claims.pty,
        };
        self.issue(&principal, Some(claims.sid)).await
    }

    pub fn validate_token(&self, token: &str) -> Result<ValidatedToken> {
        self.codec.validate(token)
    }

    /// Verifies the token, then authorizes its principal through the engine
    /// instead of the embedded snapshot.
    pub async fn reverify(
        &self,
        token: &str,
        organization: &OrganizationId,
        resource: &str,
        action: &str,
    ) -> Result<Authorization> {
        let access = self.codec.validate_access(token)?;
        let permission = Permission::from_parts(resource, action)?;
        Ok(self
            .engine
            .authorize(access.principal(), organization, &permission)
            .await)
    }
}

fn collect(
    effective: &EffectivePermissions,
    roles: &mut BTreeMap<RoleId, RoleClaim>,
    permissions: &mut BTreeSet<String>,
) {
    for effective_role in &effective.roles {
        let role = &effective_role.role;
        roles.entry(role.id.clone()).or_insert_with(|| RoleClaim {
            id: role.id.clone(),
            name: role.name.clone(),
            scope: role.scope.kind().to_string(),
            organization_id: role.scope.organization().cloned(),
            group_id: role.scope.group().cloned(),
            is_active: role.is_live(),
        });
    }
    permissions.extend(effective.permission_strings());
}
