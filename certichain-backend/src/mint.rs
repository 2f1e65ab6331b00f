//! NFT minting: the `Minter` seam, the Crossmint client, and the mint
//! pipeline that charges credits and records receipts.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{extract::State, routing::post, Json, Router};
use certichain_common::{CertificateRecord, CertificateStatus, MintReceipt, PENDING_TOKEN_ID};
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    config::{CrossmintConfig, MintQueueConfig, ServiceConfig},
    store::{MintClaim, Store, StoreConflict, StoreError},
    ApiError, AppState, CODE_INVALID_INPUT,
};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const QUEUE_CAPACITY: usize = 256;
/// How long a started mint blocks other callers. Longer than
/// `HTTP_TIMEOUT`, so a live call always finishes first.
const MINT_LEASE_SECS: i64 = 600;

fn mint_lease() -> chrono::Duration {
    chrono::Duration::seconds(MINT_LEASE_SECS)
}

#[derive(Debug, Error)]
pub enum MintError {
    #[error("minting service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("minting service returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("unexpected response from minting service: {0}")]
    InvalidResponse(String),
    #[error("{0} is not available without a minting API key")]
    NotConfigured(&'static str),
    #[error("certificate {0} not found")]
    UnknownCertificate(String),
    #[error("certificate {0} is already being minted")]
    InProgress(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftAttribute {
    pub trait_type: String,
    pub value: String,
}

impl NftAttribute {
    fn new(trait_type: &str, value: impl Into<String>) -> Self {
        Self {
            trait_type: trait_type.to_string(),
            value: value.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftMetadata {
    pub name: String,
    pub description: String,
    pub image: String,
    pub external_url: String,
    pub attributes: Vec<NftAttribute>,
}

/// Everything a minting backend needs to mint one certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MintRequest {
    pub certificate_id: String,
    pub collection_id: String,
    /// `<chain>:<address>` or `email:<email>:<chain>`.
    pub recipient: String,
    pub metadata: NftMetadata,
}

impl MintRequest {
    pub fn for_certificate(record: &CertificateRecord, collection_id: &str, recipient: String) -> Self {
        let attributes = vec![
            NftAttribute::new("Certificate ID", &record.certificate_id),
            NftAttribute::new("Certificate Hash", &record.certificate_hash),
            NftAttribute::new("Issuer Signature", &record.issuer_signature),
            NftAttribute::new("Issuer Name", &record.issuer_name),
            NftAttribute::new("Issuer Wallet", &record.issuer_wallet),
            NftAttribute::new("Canonical Payload", &record.canonical_payload),
            NftAttribute::new("Recipient Name", &record.recipient_name),
            NftAttribute::new("Recipient Email", &record.recipient_email),
            NftAttribute::new("Student ID", &record.student_id),
            NftAttribute::new("Course Name", &record.course_name),
            NftAttribute::new("Issue Date", &record.issue_date),
            NftAttribute::new("PDF IPFS", &record.pdf_ipfs_url),
            NftAttribute::new("Verification URL", &record.verification_url),
            NftAttribute::new("Transferable", "false"),
        ];
        Self {
            certificate_id: record.certificate_id.clone(),
            collection_id: collection_id.to_string(),
            recipient,
            metadata: NftMetadata {
                name: format!("Certificate #{}", record.certificate_id),
                description: format!("{} - Issued by {}", record.course_name, record.issuer_name),
                image: record.pdf_ipfs_url.clone(),
                external_url: record.verification_url.clone(),
                attributes,
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub symbol: String,
    #[serde(default)]
    pub chain: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectionReceipt {
    pub collection_id: String,
    pub contract_address: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRecord {
    pub collection_id: String,
    pub name: String,
    pub description: String,
    pub symbol: String,
    pub chain: String,
    pub contract_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A backend that turns certificates into NFTs.
#[async_trait]
pub trait Minter: Send + Sync {
    async fn mint(&self, request: &MintRequest) -> Result<MintReceipt, MintError>;

    async fn create_collection(
        &self,
        request: &CollectionRequest,
        chain: &str,
    ) -> Result<CollectionReceipt, MintError>;
}

pub struct CrossmintMinter {
    client: Client,
    config: CrossmintConfig,
}

impl CrossmintMinter {
    pub fn new(config: CrossmintConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Serialize)]
struct MintBody<'a> {
    recipient: &'a str,
    metadata: &'a NftMetadata,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnChain {
    token_id: Option<String>,
    tx_id: Option<String>,
    owner: Option<String>,
    contract_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MintResponse {
    id: Option<String>,
    #[serde(default)]
    on_chain: Option<OnChain>,
}

#[derive(Serialize)]
struct CollectionMetadata<'a> {
    name: &'a str,
    description: &'a str,
    symbol: &'a str,
}

#[derive(Serialize)]
struct CollectionBody<'a> {
    chain: &'a str,
    metadata: CollectionMetadata<'a>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionResponse {
    id: Option<String>,
    contract_address: Option<String>,
}

async fn api_error(response: reqwest::Response) -> MintError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    MintError::Api { status, body }
}

fn pending(value: Option<String>) -> String {
    value
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| PENDING_TOKEN_ID.to_string())
}

#[async_trait]
impl Minter for CrossmintMinter {
    async fn mint(&self, request: &MintRequest) -> Result<MintReceipt, MintError> {
        let url = self.url(&format!("collections/{}/nfts", request.collection_id));
        debug!(certificate_id = %request.certificate_id, %url, "minting certificate NFT");

        let response = self
            .client
            .post(&url)
            .header("X-API-KEY", &self.config.api_key)
            .json(&MintBody {
                recipient: &request.recipient,
                metadata: &request.metadata,
            })
            .send()
            .await?;
        if !matches!(response.status(), StatusCode::OK | StatusCode::CREATED) {
            return Err(api_error(response).await);
        }

        let nft: MintResponse = response
            .json()
            .await
            .map_err(|err| MintError::InvalidResponse(err.to_string()))?;
        let on_chain = nft.on_chain.unwrap_or_default();
        Ok(MintReceipt {
            nft_id: nft
                .id
                .unwrap_or_else(|| format!("pending-{}", request.certificate_id)),
            token_id: pending(on_chain.token_id),
            transaction_hash: pending(on_chain.tx_id),
            recipient_wallet: pending(on_chain.owner),
            contract_address: pending(on_chain.contract_address),
        })
    }

    async fn create_collection(
        &self,
        request: &CollectionRequest,
        chain: &str,
    ) -> Result<CollectionReceipt, MintError> {
        let response = self
            .client
            .post(self.url("collections"))
            .header("X-API-KEY", &self.config.api_key)
            .json(&CollectionBody {
                chain,
                metadata: CollectionMetadata {
                    name: &request.name,
                    description: &request.description,
                    symbol: &request.symbol,
                },
            })
            .send()
            .await?;
        if !matches!(response.status(), StatusCode::OK | StatusCode::CREATED) {
            return Err(api_error(response).await);
        }

        let created: CollectionResponse = response
            .json()
            .await
            .map_err(|err| MintError::InvalidResponse(err.to_string()))?;
        let collection_id = created
            .id
            .ok_or_else(|| MintError::InvalidResponse("collection id missing".into()))?;
        Ok(CollectionReceipt {
            collection_id,
            contract_address: created.contract_address,
        })
    }
}

/// Stand-in used when no minting API key is configured. Every certificate
/// stays pending.
#[derive(Clone, Copy, Debug, Default)]
pub struct OfflineMinter;

#[async_trait]
impl Minter for OfflineMinter {
    async fn mint(&self, request: &MintRequest) -> Result<MintReceipt, MintError> {
        Ok(MintReceipt {
            nft_id: format!("pending-{}", request.certificate_id),
            token_id: PENDING_TOKEN_ID.to_string(),
            transaction_hash: PENDING_TOKEN_ID.to_string(),
            recipient_wallet: PENDING_TOKEN_ID.to_string(),
            contract_address: PENDING_TOKEN_ID.to_string(),
        })
    }

    async fn create_collection(
        &self,
        _request: &CollectionRequest,
        _chain: &str,
    ) -> Result<CollectionReceipt, MintError> {
        Err(MintError::NotConfigured("collection creation"))
    }
}

/// Runs the mint pipeline for stored certificates.
#[derive(Clone)]
pub struct MintService {
    store: Store,
    minter: Arc<dyn Minter>,
    config: Arc<ServiceConfig>,
}

impl MintService {
    pub fn new(store: Store, minter: Arc<dyn Minter>, config: Arc<ServiceConfig>) -> Self {
        Self {
            store,
            minter,
            config,
        }
    }

    pub fn minter(&self) -> &dyn Minter {
        self.minter.as_ref()
    }

    fn collection_id(&self, chain: &str) -> Result<String, StoreError> {
        Ok(match self.store.latest_collection(chain)? {
            Some(collection) => collection.collection_id,
            None => self.config.default_collection.clone(),
        })
    }

    fn recipient(&self, record: &CertificateRecord) -> Result<String, StoreError> {
        if let Some(user_id) = &record.claimed_by {
            if let Some(wallet) = self.store.user_wallet(user_id)? {
                return Ok(format!("{}:{}", record.chain, wallet.wallet_address));
            }
        }
        Ok(format!("email:{}:{}", record.recipient_email, record.chain))
    }

    /// Mint `certificate_id` once. Minter failures are recorded on the
    /// certificate (`MintFailed`) rather than returned; `Err` means the
    /// certificate could not be loaded or saved, or another caller is
    /// minting it right now.
    pub async fn process(&self, certificate_id: &str) -> Result<CertificateRecord, MintError> {
        let record = self
            .store
            .certificate(certificate_id)?
            .ok_or_else(|| MintError::UnknownCertificate(certificate_id.to_string()))?;
        if record.is_minted() {
            return Ok(record);
        }

        let issuer = match self.store.group(record.group_id)? {
            Some(group) => group.created_by,
            None => return Err(StoreError::from(StoreConflict::GroupNotFound(record.group_id)).into()),
        };
        let collection_id = self.collection_id(&record.chain)?;
        let recipient = self.recipient(&record)?;

        let claim = self
            .store
            .begin_mint(certificate_id, &issuer, Utc::now(), mint_lease())?
            .ok_or_else(|| MintError::UnknownCertificate(certificate_id.to_string()))?;
        let mut record = match claim {
            MintClaim::Started(record) => record,
            MintClaim::AlreadyMinted(record) => return Ok(record),
            MintClaim::InFlight(_) => {
                return Err(MintError::InProgress(certificate_id.to_string()))
            }
            MintClaim::AwaitingCredits(record) => {
                info!(%certificate_id, %issuer, "issuer has no mint credits left");
                return Ok(record);
            }
        };

        let request = MintRequest::for_certificate(&record, &collection_id, recipient);
        let minted = match self.minter.mint(&request).await {
            Ok(receipt) => {
                info!(
                    %certificate_id,
                    nft_id = %receipt.nft_id,
                    pending = receipt.is_pending(),
                    "certificate minted"
                );
                record.record_receipt(receipt);
                true
            }
            Err(err) => {
                warn!(%certificate_id, %err, attempt = record.mint_attempts, "mint failed");
                record.record_failure(err.to_string());
                false
            }
        };
        self.store.finish_mint(&record, &issuer, minted, Utc::now())?;
        Ok(record)
    }
}

#[derive(Clone, Debug)]
pub struct MintJob {
    pub certificate_id: String,
}

/// Where freshly claimed certificates go for minting.
#[derive(Clone, Debug)]
pub enum MintDispatch {
    /// Mint on the request path.
    Inline,
    /// Hand off to the background [`MintQueue`] worker.
    Queued(mpsc::Sender<MintJob>),
}

impl MintDispatch {
    /// Returns the updated record when minting ran inline, `None` when the
    /// job was queued.
    pub async fn dispatch(
        &self,
        service: &MintService,
        certificate_id: &str,
    ) -> Result<Option<CertificateRecord>, MintError> {
        match self {
            MintDispatch::Inline => service.process(certificate_id).await.map(Some),
            MintDispatch::Queued(sender) => {
                let job = MintJob {
                    certificate_id: certificate_id.to_string(),
                };
                match sender.send(job).await {
                    Ok(()) => Ok(None),
                    Err(_) => {
                        warn!(%certificate_id, "mint queue closed, minting inline");
                        service.process(certificate_id).await.map(Some)
                    }
                }
            }
        }
    }
}

pub struct MintQueue;

impl MintQueue {
    /// Start the background worker. The worker exits once every sender is
    /// dropped and the queue is drained.
    pub fn spawn(service: MintService, config: MintQueueConfig) -> (MintDispatch, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<MintJob>(QUEUE_CAPACITY);
        let handle = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                run_job(&service, &job, config).await;
            }
            debug!("mint queue drained");
        });
        (MintDispatch::Queued(sender), handle)
    }
}

async fn run_job(service: &MintService, job: &MintJob, config: MintQueueConfig) {
    for attempt in 1..=config.max_retries.max(1) {
        match service.process(&job.certificate_id).await {
            Ok(record) if record.status == CertificateStatus::MintFailed => {
                if attempt < config.max_retries {
                    debug!(certificate_id = %job.certificate_id, attempt, "retrying mint");
                    tokio::time::sleep(config.retry_delay).await;
                    continue;
                }
                error!(
                    certificate_id = %job.certificate_id,
                    attempts = attempt,
                    "giving up on minting"
                );
            }
            Ok(_) => {}
            Err(MintError::InProgress(_)) => {
                debug!(certificate_id = %job.certificate_id, "mint already running elsewhere");
            }
            Err(err) => error!(certificate_id = %job.certificate_id, %err, "mint job failed"),
        }
        return;
    }
}

pub(crate) fn routes() -> Router<AppState> {
    Router::new().route("/api/crossmint/collection", post(create_collection))
}

async fn create_collection(
    State(state): State<AppState>,
    Json(request): Json<CollectionRequest>,
) -> Result<Json<CollectionRecord>, ApiError> {
    if request.name.trim().is_empty() || request.symbol.trim().is_empty() {
        return Err(ApiError::bad_request(
            CODE_INVALID_INPUT,
            "collection name and symbol are required",
        ));
    }
    let chain = request
        .chain
        .clone()
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| state.config().chain.clone());

    let receipt = state
        .mint_service()
        .minter()
        .create_collection(&request, &chain)
        .await?;
    let collection = CollectionRecord {
        collection_id: receipt.collection_id,
        name: request.name.trim().to_string(),
        description: request.description,
        symbol: request.symbol.trim().to_string(),
        chain,
        contract_address: receipt.contract_address,
        created_at: Utc::now(),
    };
    state.store().put_collection(&collection)?;
    info!(collection_id = %collection.collection_id, chain = %collection.chain, "created collection");
    Ok(Json(collection))
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use certichain_common::{
        generate_certificate_id, verification_url, CertificateData, FieldKind, Group, SigningWallet,
    };

    use super::*;
    use crate::subscription::FREE_MINT_CREDITS;

    struct FailingMinter;

    #[async_trait]
    impl Minter for FailingMinter {
        async fn mint(&self, _request: &MintRequest) -> Result<MintReceipt, MintError> {
            Err(MintError::Api {
                status: 500,
                body: "boom".into(),
            })
        }

        async fn create_collection(
            &self,
            _request: &CollectionRequest,
            _chain: &str,
        ) -> Result<CollectionReceipt, MintError> {
            Err(MintError::NotConfigured("collection creation"))
        }
    }

    /// Takes a while to answer and counts how often it was asked.
    #[derive(Default)]
    struct SlowMinter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Minter for SlowMinter {
        async fn mint(&self, request: &MintRequest) -> Result<MintReceipt, MintError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            OfflineMinter.mint(request).await
        }

        async fn create_collection(
            &self,
            _request: &CollectionRequest,
            _chain: &str,
        ) -> Result<CollectionReceipt, MintError> {
            Err(MintError::NotConfigured("collection creation"))
        }
    }

    fn claimed(store: &Store) -> CertificateRecord {
        let group = Group::new("Rust 101", None, 10, "instructor").unwrap();
        store.create_group(&group, Utc::now()).unwrap();
        store
            .set_template_image(group.id, "https://img.example/bg.png", None)
            .unwrap();
        store
            .edit_template(group.id, |t| t.add_field("Name", FieldKind::Text, None))
            .unwrap();
        let group = store.deploy_group(group.id).unwrap();

        let issuer = SigningWallet::generate();
        let id = generate_certificate_id(Utc::now().timestamp());
        let data = CertificateData {
            certificate_id: id.clone(),
            recipient_name: "Grace".into(),
            recipient_email: "grace@example.com".into(),
            student_id: String::new(),
            course_name: group.name.clone(),
            issuer_name: "Teacher".into(),
            issuer_wallet: issuer.address(),
            issue_date: "2024-01-01T00:00:00Z".into(),
            group_id: group.id.to_string(),
            verification_url: verification_url("http://localhost:3000", &id),
            field_data: BTreeMap::from([("Name".to_string(), "Grace".to_string())]),
        };
        let record = CertificateRecord::issue(data, &issuer, group.id, None, "polygon", None).unwrap();
        store.insert_claim(&record).unwrap();
        record
    }

    fn service(store: &Store, minter: Arc<dyn Minter>) -> MintService {
        MintService::new(store.clone(), minter, Arc::new(ServiceConfig::default()))
    }

    #[test]
    fn request_carries_the_full_attribute_list() {
        let store = Store::in_memory().unwrap();
        let record = claimed(&store);
        let request = MintRequest::for_certificate(&record, "col", "email:grace@example.com:polygon".into());
        assert_eq!(request.metadata.attributes.len(), 14);
        assert_eq!(request.metadata.name, format!("Certificate #{}", record.certificate_id));
        assert_eq!(request.metadata.description, "Rust 101 - Issued by Teacher");
        let last = request.metadata.attributes.last().unwrap();
        assert_eq!((last.trait_type.as_str(), last.value.as_str()), ("Transferable", "false"));
    }

    #[tokio::test]
    async fn offline_minter_leaves_certificate_pending_and_charges_a_credit() {
        let store = Store::in_memory().unwrap();
        let record = claimed(&store);
        let minted = service(&store, Arc::new(OfflineMinter))
            .process(&record.certificate_id)
            .await
            .unwrap();

        assert_eq!(minted.status, CertificateStatus::MintPending);
        assert_eq!(minted.mint_attempts, 1);
        let receipt = minted.mint.unwrap();
        assert_eq!(receipt.nft_id, format!("pending-{}", record.certificate_id));
        let sub = store.subscription("instructor").unwrap().unwrap();
        assert_eq!(sub.mint_credits, FREE_MINT_CREDITS - 1);
        assert_eq!(sub.total_certificates_issued, 1);
    }

    #[tokio::test]
    async fn failed_mint_refunds_the_credit() {
        let store = Store::in_memory().unwrap();
        let record = claimed(&store);
        let failed = service(&store, Arc::new(FailingMinter))
            .process(&record.certificate_id)
            .await
            .unwrap();

        assert_eq!(failed.status, CertificateStatus::MintFailed);
        assert!(failed.mint_error.unwrap().contains("boom"));
        let sub = store.subscription("instructor").unwrap().unwrap();
        assert_eq!(sub.mint_credits, FREE_MINT_CREDITS);
    }

    #[tokio::test]
    async fn no_credits_parks_the_certificate() {
        let store = Store::in_memory().unwrap();
        let record = claimed(&store);
        store
            .update_subscription("instructor", Utc::now(), |sub| {
                sub.mint_credits = 0;
                Ok(())
            })
            .unwrap();

        let parked = service(&store, Arc::new(OfflineMinter))
            .process(&record.certificate_id)
            .await
            .unwrap();
        assert_eq!(parked.status, CertificateStatus::AwaitingCredits);
        assert_eq!(parked.mint_attempts, 0);
    }

    #[tokio::test]
    async fn queued_dispatch_is_processed_by_the_worker() {
        let store = Store::in_memory().unwrap();
        let record = claimed(&store);
        let (dispatch, worker) = MintQueue::spawn(
            service(&store, Arc::new(OfflineMinter)),
            MintQueueConfig::default(),
        );

        let inline = dispatch
            .dispatch(&service(&store, Arc::new(OfflineMinter)), &record.certificate_id)
            .await
            .unwrap();
        assert!(inline.is_none());
        drop(dispatch);
        worker.await.unwrap();

        let stored = store.certificate(&record.certificate_id).unwrap().unwrap();
        assert_eq!(stored.status, CertificateStatus::MintPending);
    }

    #[tokio::test]
    async fn unknown_certificate_is_an_error() {
        let store = Store::in_memory().unwrap();
        let err = service(&store, Arc::new(OfflineMinter))
            .process("CERT-0-NOPE00")
            .await
            .unwrap_err();
        assert!(matches!(err, MintError::UnknownCertificate(_)));
    }

    #[tokio::test]
    async fn concurrent_calls_mint_a_certificate_once() {
        let store = Store::in_memory().unwrap();
        let record = claimed(&store);
        let minter = Arc::new(SlowMinter::default());
        let svc = service(&store, minter.clone());

        let (first, second) = tokio::join!(
            svc.process(&record.certificate_id),
            svc.process(&record.certificate_id)
        );

        assert_eq!(minter.calls.load(Ordering::SeqCst), 1);
        let (done, refused) = match (first, second) {
            (Ok(done), Err(err)) | (Err(err), Ok(done)) => (done, err),
            other => panic!("expected one mint and one refusal, got {other:?}"),
        };
        assert_eq!(done.status, CertificateStatus::MintPending);
        assert_eq!(done.mint_attempts, 1);
        assert!(matches!(refused, MintError::InProgress(_)));

        let sub = store.subscription("instructor").unwrap().unwrap();
        assert_eq!(sub.mint_credits, FREE_MINT_CREDITS - 1);
        assert_eq!(sub.total_certificates_issued, 1);
        let stored = store.certificate(&record.certificate_id).unwrap().unwrap();
        assert_eq!(stored.mint_started_at, None);

        // Once finished, a further call is a no-op.
        let again = svc.process(&record.certificate_id).await.unwrap();
        assert_eq!(again.mint_attempts, 1);
        assert_eq!(minter.calls.load(Ordering::SeqCst), 1);
    }
}
