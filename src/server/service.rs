use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::context::CallContext;
use crate::identity::TokenIssuer;
use crate::proto::account_service_server::AccountService;
use crate::proto::directory_service_server::DirectoryService;
use crate::proto::{
    GetSessionRequest, ListRegionsRequest, ListRegionsResponse, PutRegionRequest, Region,
    RegisterRequest, RegisterResponse, SessionInfo, SignInRequest, SignInResponse,
    SignOutRequest, SignOutResponse, WhoAmIRequest, WhoAmIResponse,
};
use crate::session::{Identity, NewAccount, Session, SessionManager};
use crate::{Error, Result};

/// Role granted to identifiers listed in the `admins` setting.
pub const ADMIN_ROLE: &str = "admin";

/// Role granted to every other account.
pub const MEMBER_ROLE: &str = "member";

/// Every `<service>/<method>` the server routes, health checks included.
pub const SERVED_METHODS: [&str; 10] = [
    "callguard.v1.AccountService/Register",
    "callguard.v1.AccountService/SignIn",
    "callguard.v1.AccountService/GetSession",
    "callguard.v1.AccountService/SignOut",
    "callguard.v1.AccountService/WhoAmI",
    "callguard.v1.DirectoryService/ListRegions",
    "callguard.v1.DirectoryService/WatchRegions",
    "callguard.v1.DirectoryService/PutRegion",
    "grpc.health.v1.Health/Check",
    "grpc.health.v1.Health/Watch",
];

const MAX_IDENTIFIER_LEN: usize = 256;
const MAX_SECRET_LEN: usize = 1024;
const MAX_DISPLAY_NAME_LEN: usize = 256;
const MAX_REGIONS: usize = 1_000;
const WATCH_BUFFER: usize = 16;

/// Account lifecycle: registration, sign-in, sessions, caller identity.
pub struct AccountServiceImpl {
    sessions: SessionManager,
    issuer: TokenIssuer,
    admins: Arc<HashSet<String>>,
}

impl AccountServiceImpl {
    /// Creates the service. Identifiers in `admins` register with role `admin`.
    pub fn new(sessions: SessionManager, issuer: TokenIssuer, admins: HashSet<String>) -> Self {
        Self {
            sessions,
            issuer,
            admins: Arc::new(admins),
        }
    }

    fn validate_identifier(identifier: &str) -> Result<()> {
        if identifier.is_empty() {
            return Err(Error::Validation("identifier cannot be empty".to_string()));
        }

        if identifier.len() > MAX_IDENTIFIER_LEN {
            return Err(Error::Validation("identifier too long".to_string()));
        }

        if !identifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(Error::Validation(
                "identifier contains invalid characters".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_registration(req: &RegisterRequest) -> Result<()> {
        Self::validate_identifier(&req.identifier)?;

        if req.secret.is_empty() || req.secret.len() > MAX_SECRET_LEN {
            return Err(Error::Validation(format!(
                "secret must be between 1 and {MAX_SECRET_LEN} bytes"
            )));
        }

        if !req.email.contains('@') {
            return Err(Error::Validation("email is not valid".to_string()));
        }

        if req.display_name.len() > MAX_DISPLAY_NAME_LEN {
            return Err(Error::Validation("display name too long".to_string()));
        }

        Ok(())
    }

    /// Resolves `session_id` and checks the caller may act on it.
    async fn owned_session(&self, ctx: &CallContext, session_id: &str) -> Result<Option<Session>> {
        let caller = ctx.caller()?;

        let session = match self.sessions.get_session(session_id).await {
            Ok(session) => session,
            Err(Error::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        if session.identity.id != caller.subject_id && caller.role != ADMIN_ROLE {
            return Err(Error::Authorization(
                "session belongs to another user".to_string(),
            ));
        }

        Ok(Some(session))
    }
}

fn session_info(session: &Session) -> SessionInfo {
    SessionInfo {
        session_id: session.session_id.clone(),
        user_id: session.identity.id.clone(),
        display_name: session.identity.display_name.clone(),
        email: session.identity.email.clone(),
        issued_at: i64::try_from(session.issued_at).unwrap_or(i64::MAX),
        expires_at: i64::try_from(session.expires_at()).unwrap_or(i64::MAX),
    }
}

#[tonic::async_trait]
impl AccountService for AccountServiceImpl {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> std::result::Result<Response<RegisterResponse>, Status> {
        let ctx = CallContext::of(&request)?.clone();
        let req = request.into_inner();

        Self::validate_registration(&req)?;

        let role = if self.admins.contains(&req.identifier) {
            ADMIN_ROLE
        } else {
            MEMBER_ROLE
        };
        let display_name = if req.display_name.is_empty() {
            req.identifier.clone()
        } else {
            req.display_name
        };

        let record = ctx
            .within_deadline(self.sessions.register(NewAccount {
                identifier: req.identifier,
                secret: req.secret,
                display_name,
                email: req.email,
                role: role.to_string(),
            }))
            .await?;

        Ok(Response::new(RegisterResponse { user_id: record.id }))
    }

    async fn sign_in(
        &self,
        request: Request<SignInRequest>,
    ) -> std::result::Result<Response<SignInResponse>, Status> {
        let ctx = CallContext::of(&request)?.clone();
        let req = request.into_inner();

        if req.identifier.is_empty() || req.secret.is_empty() {
            let err = Error::Validation("identifier and secret are required".to_string());
            return Err(err.into());
        }

        let record = ctx
            .within_deadline(self.sessions.authenticate(&req.identifier, &req.secret))
            .await?;

        // Mint before the session write; a signing failure must leave no session.
        let token = self.issuer.issue(&record.id, &record.role)?;

        let session = ctx
            .within_deadline(self.sessions.issue_session(Identity::from(&record)))
            .await?;

        Ok(Response::new(SignInResponse {
            session_id: session.session_id,
            access_token: token.token,
            token_expires_at: i64::try_from(token.expires_at).unwrap_or(i64::MAX),
        }))
    }

    async fn get_session(
        &self,
        request: Request<GetSessionRequest>,
    ) -> std::result::Result<Response<SessionInfo>, Status> {
        let ctx = CallContext::of(&request)?.clone();
        let req = request.into_inner();

        let session = ctx
            .within_deadline(self.owned_session(&ctx, &req.session_id))
            .await?
            .ok_or_else(|| Error::NotFound("session not found or expired".to_string()))?;

        Ok(Response::new(session_info(&session)))
    }

    async fn sign_out(
        &self,
        request: Request<SignOutRequest>,
    ) -> std::result::Result<Response<SignOutResponse>, Status> {
        let ctx = CallContext::of(&request)?.clone();
        let req = request.into_inner();

        ctx.within_deadline(async {
            if self.owned_session(&ctx, &req.session_id).await?.is_some() {
                self.sessions.sign_out(&req.session_id).await?;
            }
            Ok(())
        })
        .await?;

        Ok(Response::new(SignOutResponse {}))
    }

    async fn who_am_i(
        &self,
        request: Request<WhoAmIRequest>,
    ) -> std::result::Result<Response<WhoAmIResponse>, Status> {
        let ctx = CallContext::of(&request)?;
        let caller = ctx.caller()?;

        Ok(Response::new(WhoAmIResponse {
            subject_id: caller.subject_id.clone(),
            role: caller.role.clone(),
            correlation_id: ctx.correlation_id.clone().unwrap_or_default(),
        }))
    }
}

/// Reference regions: public listing, authenticated watch, admin-only writes.
#[derive(Clone)]
pub struct DirectoryServiceImpl {
    regions: Arc<RwLock<BTreeMap<String, String>>>,
    updates: broadcast::Sender<Region>,
}

impl Default for DirectoryServiceImpl {
    fn default() -> Self {
        Self::new([
            ("ap-south", "Asia Pacific (South)"),
            ("eu-central", "Europe (Central)"),
            ("eu-west", "Europe (West)"),
            ("us-east", "US East"),
            ("us-west", "US West"),
        ])
    }
}

impl DirectoryServiceImpl {
    /// Creates the directory seeded with `regions` as `(code, name)` pairs.
    pub fn new<I, C, N>(regions: I) -> Self
    where
        I: IntoIterator<Item = (C, N)>,
        C: Into<String>,
        N: Into<String>,
    {
        let (updates, _) = broadcast::channel(WATCH_BUFFER);
        let regions = regions
            .into_iter()
            .map(|(code, name)| (code.into(), name.into()))
            .collect();

        Self {
            regions: Arc::new(RwLock::new(regions)),
            updates,
        }
    }

    async fn snapshot(&self) -> Vec<Region> {
        self.regions
            .read()
            .await
            .iter()
            .map(|(code, name)| Region {
                code: code.clone(),
                name: name.clone(),
            })
            .collect()
    }

    fn validate_region(req: &PutRegionRequest) -> Result<()> {
        let code_ok = (2..=32).contains(&req.code.len())
            && req
                .code
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !code_ok {
            return Err(Error::Validation(
                "region code must be 2-32 characters of [a-z0-9-]".to_string(),
            ));
        }

        if req.name.trim().is_empty() || req.name.len() > 128 {
            return Err(Error::Validation(
                "region name must be between 1 and 128 bytes".to_string(),
            ));
        }

        Ok(())
    }
}

#[tonic::async_trait]
impl DirectoryService for DirectoryServiceImpl {
    async fn list_regions(
        &self,
        _request: Request<ListRegionsRequest>,
    ) -> std::result::Result<Response<ListRegionsResponse>, Status> {
        Ok(Response::new(ListRegionsResponse {
            regions: self.snapshot().await,
        }))
    }

    type WatchRegionsStream = ReceiverStream<std::result::Result<Region, Status>>;

    async fn watch_regions(
        &self,
        request: Request<ListRegionsRequest>,
    ) -> std::result::Result<Response<Self::WatchRegionsStream>, Status> {
        let ctx = CallContext::of(&request)?;
        let deadline = ctx.deadline;
        let subject_id = ctx.caller()?.subject_id.clone();

        // Subscribe before the snapshot so no update between the two is lost.
        let mut updates = self.updates.subscribe();
        let snapshot = self.snapshot().await;
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);

        tokio::spawn(async move {
            for region in snapshot {
                if tx.send(Ok(region)).await.is_err() {
                    return;
                }
            }

            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {
                        let _ = tx.send(Err(Status::from(Error::DeadlineExceeded))).await;
                        return;
                    }
                    _ = tx.closed() => return,
                    update = updates.recv() => match update {
                        Ok(region) => {
                            if tx.send(Ok(region)).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(%subject_id, skipped, "region watcher lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn put_region(
        &self,
        request: Request<PutRegionRequest>,
    ) -> std::result::Result<Response<Region>, Status> {
        let ctx = CallContext::of(&request)?.clone();
        let caller = ctx.require_role(ADMIN_ROLE)?;
        let req = request.into_inner();

        Self::validate_region(&req)?;

        {
            let mut regions = self.regions.write().await;
            if regions.len() >= MAX_REGIONS && !regions.contains_key(&req.code) {
                return Err(Error::Validation(format!(
                    "directory holds at most {MAX_REGIONS} regions"
                ))
                .into());
            }
            regions.insert(req.code.clone(), req.name.clone());
        }

        let region = Region {
            code: req.code,
            name: req.name,
        };
        tracing::info!(subject_id = %caller.subject_id, code = %region.code, "region updated");
        // No receivers is fine.
        let _ = self.updates.send(region.clone());

        Ok(Response::new(region))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::identity::TokenVerifier;
    use crate::session::{MemoryCredentialStore, MemorySessionStore};

    const SECRET: &[u8] = b"an-unguessable-32-byte-test-secret!!";

    fn with_context<T>(method: &str, message: T) -> Request<T> {
        let mut request = Request::new(message);
        request
            .extensions_mut()
            .insert(CallContext::new(method, Duration::from_secs(5)));
        request
    }

    #[tokio::test]
    async fn sign_in_writes_one_session_only_after_minting() {
        let store = MemorySessionStore::new();
        let sessions = SessionManager::new(
            Arc::new(store.clone()),
            Arc::new(MemoryCredentialStore::new()),
            Duration::from_secs(60),
        );
        let service = AccountServiceImpl::new(
            sessions,
            TokenIssuer::new(SECRET, Duration::from_secs(60)),
            HashSet::new(),
        );

        service
            .register(with_context(
                "callguard.v1.AccountService/Register",
                registration("alice", "pw", "a@example.com"),
            ))
            .await
            .unwrap();

        let rejected = service
            .sign_in(with_context(
                "callguard.v1.AccountService/SignIn",
                SignInRequest {
                    identifier: "alice".to_string(),
                    secret: "nope".to_string(),
                },
            ))
            .await;
        assert_eq!(rejected.unwrap_err().code(), tonic::Code::Unauthenticated);
        assert!(store.is_empty().await);

        let signed_in = service
            .sign_in(with_context(
                "callguard.v1.AccountService/SignIn",
                SignInRequest {
                    identifier: "alice".to_string(),
                    secret: "pw".to_string(),
                },
            ))
            .await
            .unwrap()
            .into_inner();

        assert_eq!(store.len().await, 1);
        let claims = TokenVerifier::new(SECRET).verify(&signed_in.access_token).unwrap();
        assert_eq!(claims.role, MEMBER_ROLE);
    }

    fn registration(identifier: &str, secret: &str, email: &str) -> RegisterRequest {
        RegisterRequest {
            identifier: identifier.to_string(),
            secret: secret.to_string(),
            display_name: String::new(),
            email: email.to_string(),
        }
    }

    #[test]
    fn registration_validation() {
        assert!(AccountServiceImpl::validate_registration(&registration(
            "alice.b-1_x",
            "pw",
            "a@example.com"
        ))
        .is_ok());

        let rejected = [
            registration("", "pw", "a@example.com"),
            registration("alice smith", "pw", "a@example.com"),
            registration(&"a".repeat(MAX_IDENTIFIER_LEN + 1), "pw", "a@example.com"),
            registration("alice", "", "a@example.com"),
            registration("alice", &"s".repeat(MAX_SECRET_LEN + 1), "a@example.com"),
            registration("alice", "pw", "not-an-email"),
        ];
        for req in rejected {
            assert!(matches!(
                AccountServiceImpl::validate_registration(&req),
                Err(Error::Validation(_))
            ));
        }
    }

    #[test]
    fn region_validation() {
        let ok = PutRegionRequest {
            code: "sa-east".to_string(),
            name: "South America (East)".to_string(),
        };
        assert!(DirectoryServiceImpl::validate_region(&ok).is_ok());

        let bad_code = PutRegionRequest {
            code: "SA East".to_string(),
            name: "x".to_string(),
        };
        assert!(DirectoryServiceImpl::validate_region(&bad_code).is_err());

        let blank_name = PutRegionRequest {
            code: "sa-east".to_string(),
            name: "  ".to_string(),
        };
        assert!(DirectoryServiceImpl::validate_region(&blank_name).is_err());
    }

    #[tokio::test]
    async fn directory_lists_seeded_regions_in_order() {
        let directory = DirectoryServiceImpl::new([("b", "B"), ("a", "A")]);
        let codes: Vec<String> = directory
            .snapshot()
            .await
            .into_iter()
            .map(|r| r.code)
            .collect();
        assert_eq!(codes, ["a", "b"]);
    }
}
