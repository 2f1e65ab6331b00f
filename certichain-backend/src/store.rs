//! sled-backed persistence.
//!
//! One tree per table, values are JSON. Two index trees keep lookups cheap:
//! `join_codes` maps a code to its group id, and `claims` maps
//! `<group_id>|<email>` to the certificate issued for that learner. Writes that
//! touch more than one table run inside a sled transaction.

use std::{fs, path::Path};

use certichain_common::{
    generate_join_code, CanvasSize, CertError, CertResult, CertificateRecord, CertificateStatus,
    Group, GroupStatus, Template,
};
use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sled::{
    transaction::{
        ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
        TransactionalTree,
    },
    Db, Transactional, Tree,
};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::{
    mint::CollectionRecord,
    subscription::Subscription,
    verify::VerificationLog,
    wallets::{Instructor, UserWallet},
};

const MAX_JOIN_CODE_ATTEMPTS: usize = 16;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("stored record is corrupt: {0}")]
    Codec(#[from] serde_json::Error),
    #[error(transparent)]
    Conflict(#[from] StoreConflict),
    #[error("could not allocate a unique join code")]
    JoinCodesExhausted,
}

/// Business-rule violations detected inside a transaction.
#[derive(Debug, Error)]
pub enum StoreConflict {
    #[error("group {0} not found")]
    GroupNotFound(Uuid),
    #[error("group is not accepting claims")]
    GroupNotActive,
    #[error("group can no longer be edited")]
    GroupLocked,
    #[error("group {0} has no template yet")]
    TemplateNotFound(Uuid),
    #[error("group has reached its learner capacity")]
    GroupFull,
    #[error("a certificate was already claimed with this email")]
    AlreadyClaimed,
    #[error("group limit of {limit} reached for the current plan")]
    GroupLimitReached { limit: u32 },
    #[error("no mint credits remaining")]
    NoCredits,
    #[error(transparent)]
    Rejected(#[from] CertError),
}

enum Abort {
    Conflict(StoreConflict),
    Codec(serde_json::Error),
    JoinCodeTaken,
}

impl From<StoreConflict> for Abort {
    fn from(conflict: StoreConflict) -> Self {
        Abort::Conflict(conflict)
    }
}

type TxResult<T> = ConflictableTransactionResult<T, Abort>;

fn abort<T>(reason: impl Into<Abort>) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(reason.into()))
}

fn tx_get<T: DeserializeOwned>(tree: &TransactionalTree, key: &[u8]) -> TxResult<Option<T>> {
    match tree.get(key)? {
        Some(raw) => serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|err| ConflictableTransactionError::Abort(Abort::Codec(err))),
        None => Ok(None),
    }
}

fn tx_put<T: Serialize>(tree: &TransactionalTree, key: &[u8], value: &T) -> TxResult<()> {
    let bytes = serde_json::to_vec(value)
        .map_err(|err| ConflictableTransactionError::Abort(Abort::Codec(err)))?;
    tree.insert(key, bytes)?;
    Ok(())
}

fn finish<T>(result: Result<T, TransactionError<Abort>>) -> Result<T, StoreError> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(Abort::Conflict(conflict))) => Err(conflict.into()),
        Err(TransactionError::Abort(Abort::Codec(err))) => Err(err.into()),
        Err(TransactionError::Abort(Abort::JoinCodeTaken)) => Err(StoreError::JoinCodesExhausted),
        Err(TransactionError::Storage(err)) => Err(err.into()),
    }
}

/// Result of trying to take the mint of a certificate.
#[derive(Debug)]
pub enum MintClaim {
    /// The caller now holds the mint and one credit has been debited.
    Started(CertificateRecord),
    AlreadyMinted(CertificateRecord),
    /// Another caller holds an unexpired mint.
    InFlight(CertificateRecord),
    /// The issuer is out of credits; the record was parked.
    AwaitingCredits(CertificateRecord),
}

fn claim_key(group_id: Uuid, email: &str) -> String {
    format!("{group_id}|{}", email.trim().to_ascii_lowercase())
}

#[derive(Clone)]
pub struct Store {
    db: Db,
    groups: Tree,
    templates: Tree,
    certificates: Tree,
    instructors: Tree,
    user_wallets: Tree,
    subscriptions: Tree,
    collections: Tree,
    verification_logs: Tree,
    join_codes: Tree,
    claims: Tree,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(sled::Error::Io)?;
            }
        }
        Self::from_db(sled::open(path)?)
    }

    /// A throwaway database removed when the last handle drops.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> Result<Self, StoreError> {
        Ok(Self {
            groups: db.open_tree("groups")?,
            templates: db.open_tree("templates")?,
            certificates: db.open_tree("certificates")?,
            instructors: db.open_tree("instructors")?,
            user_wallets: db.open_tree("user_wallets")?,
            subscriptions: db.open_tree("subscriptions")?,
            collections: db.open_tree("collections")?,
            verification_logs: db.open_tree("verification_logs")?,
            join_codes: db.open_tree("join_codes")?,
            claims: db.open_tree("claims")?,
            db,
        })
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(tree: &Tree, key: impl AsRef<[u8]>) -> Result<Option<T>, StoreError> {
        match tree.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn put<T: Serialize>(tree: &Tree, key: impl AsRef<[u8]>, value: &T) -> Result<(), StoreError> {
        tree.insert(key.as_ref(), serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn values<T: DeserializeOwned>(
        iter: impl Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>>,
    ) -> Result<Vec<T>, StoreError> {
        iter.map(|entry| {
            let (_, raw) = entry?;
            Ok(serde_json::from_slice(&raw)?)
        })
        .collect()
    }

    // Groups

    /// Insert a new draft group, charging it against the creator's plan.
    pub fn create_group(&self, group: &Group, now: DateTime<Utc>) -> Result<Subscription, StoreError> {
        let key = group.created_by.as_bytes();
        let result = (&self.groups, &self.subscriptions).transaction(
            |(groups, subscriptions)| -> TxResult<Subscription> {
                let mut subscription = tx_get::<Subscription>(subscriptions, key)?
                    .unwrap_or_else(|| Subscription::free(&group.created_by, now));
                if !subscription.can_create_group(now) {
                    return abort(StoreConflict::GroupLimitReached {
                        limit: subscription.groups_limit(now),
                    });
                }
                subscription.groups_created += 1;
                subscription.updated_at = now;
                tx_put(subscriptions, key, &subscription)?;
                tx_put(groups, group.id.as_bytes(), group)?;
                Ok(subscription)
            },
        );
        finish(result)
    }

    pub fn group(&self, id: Uuid) -> Result<Option<Group>, StoreError> {
        Self::get(&self.groups, id.as_bytes())
    }

    /// Newest first.
    pub fn groups_created_by(&self, user_id: &str) -> Result<Vec<Group>, StoreError> {
        let mut groups: Vec<Group> = Self::values(self.groups.iter())?
            .into_iter()
            .filter(|g: &Group| g.created_by == user_id)
            .collect();
        groups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(groups)
    }

    pub fn group_by_join_code(&self, code: &str) -> Result<Option<Group>, StoreError> {
        match self.join_codes.get(code.as_bytes())? {
            Some(raw) => {
                let id = Uuid::from_slice(&raw)
                    .map_err(|err| sled::Error::Unsupported(format!("bad group id index: {err}")))?;
                self.group(id)
            }
            None => Ok(None),
        }
    }

    /// Deploy a draft group under a freshly allocated, unique join code. The
    /// template is read in the same transaction, so a concurrent edit cannot
    /// slip in between the deployability check and activation.
    pub fn deploy_group(&self, group_id: Uuid) -> Result<Group, StoreError> {
        for attempt in 1..=MAX_JOIN_CODE_ATTEMPTS {
            let code = generate_join_code();
            let result = (&self.groups, &self.join_codes, &self.templates).transaction(
                |(groups, join_codes, templates)| -> TxResult<Group> {
                    let Some(mut group) = tx_get::<Group>(groups, group_id.as_bytes())? else {
                        return abort(StoreConflict::GroupNotFound(group_id));
                    };
                    if group.status != GroupStatus::Draft {
                        return abort(StoreConflict::GroupLocked);
                    }
                    if join_codes.get(code.as_bytes())?.is_some() {
                        return Err(ConflictableTransactionError::Abort(Abort::JoinCodeTaken));
                    }
                    let template = tx_get::<Template>(templates, group_id.as_bytes())?;
                    if let Err(err) = group.deploy(template.as_ref(), code.clone()) {
                        return abort(StoreConflict::Rejected(err));
                    }
                    join_codes.insert(code.as_bytes(), &group_id.as_bytes()[..])?;
                    tx_put(groups, group_id.as_bytes(), &group)?;
                    Ok(group)
                },
            );
            match result {
                Err(TransactionError::Abort(Abort::JoinCodeTaken)) => {
                    debug!(attempt, "join code collision, retrying");
                    continue;
                }
                other => return finish(other),
            }
        }
        Err(StoreError::JoinCodesExhausted)
    }

    /// Stop an active group from taking further claims.
    pub fn close_group(&self, group_id: Uuid) -> Result<Group, StoreError> {
        let result = self.groups.transaction(|groups| -> TxResult<Group> {
            let Some(mut group) = tx_get::<Group>(groups, group_id.as_bytes())? else {
                return abort(StoreConflict::GroupNotFound(group_id));
            };
            if let Err(err) = group.close() {
                return abort(StoreConflict::Rejected(err));
            }
            tx_put(groups, group_id.as_bytes(), &group)?;
            Ok(group)
        });
        finish(result)
    }

    // Templates

    pub fn template(&self, group_id: Uuid) -> Result<Option<Template>, StoreError> {
        Self::get(&self.templates, group_id.as_bytes())
    }

    /// Write a draft group's template. `change` receives the current template
    /// and runs inside a transaction that also checks the group is a draft.
    fn write_template<T, F>(&self, group_id: Uuid, change: F) -> Result<T, StoreError>
    where
        F: Fn(Option<Template>) -> Result<(Template, T), StoreConflict>,
    {
        let key = group_id.as_bytes();
        let result = (&self.groups, &self.templates).transaction(
            |(groups, templates)| -> TxResult<T> {
                let Some(group) = tx_get::<Group>(groups, key)? else {
                    return abort(StoreConflict::GroupNotFound(group_id));
                };
                if group.status != GroupStatus::Draft {
                    return abort(StoreConflict::GroupLocked);
                }
                let current = tx_get::<Template>(templates, key)?;
                let (template, out) = match change(current) {
                    Ok(changed) => changed,
                    Err(conflict) => return abort(conflict),
                };
                tx_put(templates, key, &template)?;
                Ok(out)
            },
        );
        finish(result)
    }

    /// Create the template of a draft group, or swap its background image.
    pub fn set_template_image(
        &self,
        group_id: Uuid,
        image_url: &str,
        canvas: Option<CanvasSize>,
    ) -> Result<Template, StoreError> {
        self.write_template(group_id, |current| {
            let template = match current {
                Some(mut existing) => {
                    existing.replace_image(image_url, canvas);
                    existing
                }
                None => Template::new(group_id, image_url, canvas),
            };
            Ok((template.clone(), template))
        })
    }

    /// Apply `edit` to the template of a draft group.
    pub fn edit_template<T, F>(&self, group_id: Uuid, edit: F) -> Result<T, StoreError>
    where
        F: Fn(&mut Template) -> CertResult<T>,
    {
        self.write_template(group_id, |current| {
            let mut template = current.ok_or(StoreConflict::TemplateNotFound(group_id))?;
            let out = edit(&mut template)?;
            Ok((template, out))
        })
    }

    // Certificates and claims

    pub fn has_claim(&self, group_id: Uuid, email: &str) -> Result<bool, StoreError> {
        Ok(self.claims.contains_key(claim_key(group_id, email))?)
    }

    /// Store a freshly issued certificate and take a seat in its group.
    pub fn insert_claim(&self, record: &CertificateRecord) -> Result<Group, StoreError> {
        let group_key = record.group_id.as_bytes();
        let claim = claim_key(record.group_id, &record.recipient_email);
        let result = (&self.groups, &self.certificates, &self.claims).transaction(
            |(groups, certificates, claims)| -> TxResult<Group> {
                let Some(mut group) = tx_get::<Group>(groups, group_key)? else {
                    return abort(StoreConflict::GroupNotFound(record.group_id));
                };
                if group.status != GroupStatus::Active {
                    return abort(StoreConflict::GroupNotActive);
                }
                if group.is_full() {
                    return abort(StoreConflict::GroupFull);
                }
                if claims.get(claim.as_bytes())?.is_some() {
                    return abort(StoreConflict::AlreadyClaimed);
                }
                group.learner_count += 1;
                claims.insert(claim.as_bytes(), record.certificate_id.as_bytes())?;
                tx_put(certificates, record.certificate_id.as_bytes(), record)?;
                tx_put(groups, group_key, &group)?;
                Ok(group)
            },
        );
        finish(result)
    }

    pub fn certificate(&self, id: &str) -> Result<Option<CertificateRecord>, StoreError> {
        Self::get(&self.certificates, id.as_bytes())
    }

    /// Take the mint of a certificate for `issuer`, debiting one credit. Only
    /// one caller at a time gets `Started`; the hold lapses after `lease`.
    pub fn begin_mint(
        &self,
        certificate_id: &str,
        issuer: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<MintClaim>, StoreError> {
        let cert_key = certificate_id.as_bytes();
        let issuer_key = issuer.as_bytes();
        let result = (&self.certificates, &self.subscriptions).transaction(
            |(certificates, subscriptions)| -> TxResult<Option<MintClaim>> {
                let Some(mut record) = tx_get::<CertificateRecord>(certificates, cert_key)? else {
                    return Ok(None);
                };
                if record.is_minted() {
                    return Ok(Some(MintClaim::AlreadyMinted(record)));
                }
                if record.mint_in_flight(now, lease) {
                    return Ok(Some(MintClaim::InFlight(record)));
                }
                let mut subscription = tx_get::<Subscription>(subscriptions, issuer_key)?
                    .unwrap_or_else(|| Subscription::free(issuer, now));
                if subscription.debit(1).is_err() {
                    record.status = CertificateStatus::AwaitingCredits;
                    record.mint_started_at = None;
                    tx_put(certificates, cert_key, &record)?;
                    return Ok(Some(MintClaim::AwaitingCredits(record)));
                }
                subscription.updated_at = now;
                record.start_mint(now);
                tx_put(subscriptions, issuer_key, &subscription)?;
                tx_put(certificates, cert_key, &record)?;
                Ok(Some(MintClaim::Started(record)))
            },
        );
        finish(result)
    }

    /// Store the outcome of a mint taken with [`Store::begin_mint`]. A
    /// successful call counts towards the issuer's total, a failed one gets
    /// its credit back.
    pub fn finish_mint(
        &self,
        record: &CertificateRecord,
        issuer: &str,
        succeeded: bool,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let cert_key = record.certificate_id.as_bytes();
        let issuer_key = issuer.as_bytes();
        let result = (&self.certificates, &self.subscriptions).transaction(
            |(certificates, subscriptions)| -> TxResult<()> {
                let mut subscription = tx_get::<Subscription>(subscriptions, issuer_key)?
                    .unwrap_or_else(|| Subscription::free(issuer, now));
                if succeeded {
                    subscription.total_certificates_issued += 1;
                } else {
                    subscription.refund(1);
                }
                subscription.updated_at = now;
                tx_put(subscriptions, issuer_key, &subscription)?;
                tx_put(certificates, cert_key, record)?;
                Ok(())
            },
        );
        finish(result)
    }

    /// Claimed certificates of a group, oldest first.
    pub fn certificates_for_group(&self, group_id: Uuid) -> Result<Vec<CertificateRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in self.claims.scan_prefix(format!("{group_id}|")) {
            let (_, certificate_id) = entry?;
            if let Some(record) = Self::get::<CertificateRecord>(&self.certificates, &certificate_id)? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.claimed_at.cmp(&b.claimed_at));
        Ok(records)
    }

    // Wallets and instructors

    pub fn user_wallet(&self, user_id: &str) -> Result<Option<UserWallet>, StoreError> {
        Self::get(&self.user_wallets, user_id.as_bytes())
    }

    pub fn put_user_wallet(&self, wallet: &UserWallet) -> Result<(), StoreError> {
        Self::put(&self.user_wallets, wallet.user_id.as_bytes(), wallet)
    }

    /// Insert `wallet` unless the user already has one. Returns the stored
    /// wallet and whether it was created.
    pub fn create_user_wallet(&self, wallet: &UserWallet) -> Result<(UserWallet, bool), StoreError> {
        let bytes = serde_json::to_vec(wallet)?;
        match self
            .user_wallets
            .compare_and_swap(wallet.user_id.as_bytes(), None as Option<&[u8]>, Some(bytes))?
        {
            Ok(()) => Ok((wallet.clone(), true)),
            Err(existing) => match existing.current {
                Some(raw) => Ok((serde_json::from_slice(&raw)?, false)),
                None => Ok((wallet.clone(), true)),
            },
        }
    }

    pub fn instructor(&self, user_id: &str) -> Result<Option<Instructor>, StoreError> {
        Self::get(&self.instructors, user_id.as_bytes())
    }

    /// Register an instructor together with their free-tier subscription.
    /// Returns the existing record untouched when one is already present.
    pub fn register_instructor(
        &self,
        instructor: &Instructor,
        now: DateTime<Utc>,
    ) -> Result<(Instructor, bool), StoreError> {
        let key = instructor.user_id.as_bytes();
        let result = (&self.instructors, &self.subscriptions).transaction(
            |(instructors, subscriptions)| -> TxResult<(Instructor, bool)> {
                if let Some(existing) = tx_get::<Instructor>(instructors, key)? {
                    return Ok((existing, false));
                }
                if tx_get::<Subscription>(subscriptions, key)?.is_none() {
                    tx_put(subscriptions, key, &Subscription::free(&instructor.user_id, now))?;
                }
                tx_put(instructors, key, instructor)?;
                Ok((instructor.clone(), true))
            },
        );
        finish(result)
    }

    // Subscriptions

    pub fn subscription(&self, user_id: &str) -> Result<Option<Subscription>, StoreError> {
        Self::get(&self.subscriptions, user_id.as_bytes())
    }

    /// Apply `change` to the user's subscription atomically, starting from the
    /// free tier when none exists.
    pub fn update_subscription<F>(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        change: F,
    ) -> Result<Subscription, StoreError>
    where
        F: Fn(&mut Subscription) -> Result<(), StoreConflict>,
    {
        let key = user_id.as_bytes();
        let result = self.subscriptions.transaction(|subscriptions| -> TxResult<Subscription> {
            let mut subscription = tx_get::<Subscription>(subscriptions, key)?
                .unwrap_or_else(|| Subscription::free(user_id, now));
            if let Err(conflict) = change(&mut subscription) {
                return abort(conflict);
            }
            subscription.updated_at = now;
            tx_put(subscriptions, key, &subscription)?;
            Ok(subscription)
        });
        finish(result)
    }

    // Collections

    pub fn put_collection(&self, collection: &CollectionRecord) -> Result<(), StoreError> {
        Self::put(&self.collections, collection.collection_id.as_bytes(), collection)
    }

    /// Most recently created collection on `chain`.
    pub fn latest_collection(&self, chain: &str) -> Result<Option<CollectionRecord>, StoreError> {
        let collections: Vec<CollectionRecord> = Self::values(self.collections.iter())?;
        Ok(collections
            .into_iter()
            .filter(|c| c.chain.eq_ignore_ascii_case(chain))
            .max_by(|a, b| a.created_at.cmp(&b.created_at)))
    }

    // Verification logs

    pub fn append_verification_log(&self, log: &VerificationLog) -> Result<(), StoreError> {
        let key = format!(
            "{}|{:020}|{}",
            log.certificate_id,
            log.verified_at.timestamp_micros().max(0),
            log.id
        );
        Self::put(&self.verification_logs, key, log)
    }

    /// Oldest first.
    pub fn verification_logs(&self, certificate_id: &str) -> Result<Vec<VerificationLog>, StoreError> {
        Self::values(
            self.verification_logs
                .scan_prefix(format!("{certificate_id}|")),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use certichain_common::{
        generate_certificate_id, verification_url, CertificateData, FieldKind, SigningWallet,
    };

    use super::*;

    fn draft_group(store: &Store, max_learners: u32) -> Group {
        let group = Group::new("Course", None, max_learners, "instructor").unwrap();
        store.create_group(&group, Utc::now()).unwrap();
        store
            .set_template_image(group.id, "https://img.example/t.png", None)
            .unwrap();
        store
            .edit_template(group.id, |t| t.add_field("Name", FieldKind::Text, None))
            .unwrap();
        group
    }

    fn active_group(store: &Store, max_learners: u32) -> Group {
        let group = draft_group(store, max_learners);
        store.deploy_group(group.id).unwrap()
    }

    fn record_for(group: &Group, email: &str) -> CertificateRecord {
        let issuer = SigningWallet::generate();
        let id = generate_certificate_id(Utc::now().timestamp());
        let data = CertificateData {
            certificate_id: id.clone(),
            recipient_name: "Learner".into(),
            recipient_email: email.into(),
            student_id: String::new(),
            course_name: group.name.clone(),
            issuer_name: "Teacher".into(),
            issuer_wallet: issuer.address(),
            issue_date: "2024-01-01T00:00:00Z".into(),
            group_id: group.id.to_string(),
            verification_url: verification_url("http://localhost:3000", &id),
            field_data: BTreeMap::from([("Name".to_string(), "Learner".to_string())]),
        };
        CertificateRecord::issue(data, &issuer, group.id, None, "polygon", None).unwrap()
    }

    #[test]
    fn deploy_assigns_an_indexed_join_code() {
        let store = Store::in_memory().unwrap();
        let group = active_group(&store, 10);
        let code = group.join_code.clone().unwrap();
        assert_eq!(group.status, GroupStatus::Active);
        assert_eq!(store.group_by_join_code(&code).unwrap().unwrap().id, group.id);

        let again = store.deploy_group(group.id).unwrap_err();
        assert!(matches!(again, StoreError::Conflict(StoreConflict::GroupLocked)));
    }

    #[test]
    fn claims_are_unique_per_email_and_bounded_by_capacity() {
        let store = Store::in_memory().unwrap();
        let group = active_group(&store, 2);

        store.insert_claim(&record_for(&group, "a@example.com")).unwrap();
        let dup = store.insert_claim(&record_for(&group, "A@Example.com")).unwrap_err();
        assert!(matches!(dup, StoreError::Conflict(StoreConflict::AlreadyClaimed)));

        let updated = store.insert_claim(&record_for(&group, "b@example.com")).unwrap();
        assert_eq!(updated.learner_count, 2);
        let full = store.insert_claim(&record_for(&group, "c@example.com")).unwrap_err();
        assert!(matches!(full, StoreError::Conflict(StoreConflict::GroupFull)));

        assert_eq!(store.certificates_for_group(group.id).unwrap().len(), 2);
        assert!(store.has_claim(group.id, "a@EXAMPLE.com").unwrap());
    }

    #[test]
    fn group_creation_respects_free_tier_limit() {
        let store = Store::in_memory().unwrap();
        let now = Utc::now();
        for _ in 0..2 {
            let group = Group::new("G", None, 5, "instructor").unwrap();
            store.create_group(&group, now).unwrap();
        }
        let third = Group::new("G", None, 5, "instructor").unwrap();
        let err = store.create_group(&third, now).unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict(StoreConflict::GroupLimitReached { limit: 2 })
        ));
        assert!(store.group(third.id).unwrap().is_none());
        assert_eq!(store.groups_created_by("instructor").unwrap().len(), 2);
    }

    #[test]
    fn subscription_updates_roll_back_on_conflict() {
        let store = Store::in_memory().unwrap();
        let now = Utc::now();
        let err = store
            .update_subscription("nobody", now, |_| Err(StoreConflict::NoCredits))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(StoreConflict::NoCredits)));
        assert!(store.subscription("nobody").unwrap().is_none());
    }

    #[test]
    fn deployed_templates_are_locked() {
        let store = Store::in_memory().unwrap();
        let group = active_group(&store, 10);

        let err = store
            .edit_template(group.id, |t| t.add_field("Grade", FieldKind::Text, None))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(StoreConflict::GroupLocked)));
        let err = store
            .set_template_image(group.id, "https://img.example/other.png", None)
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(StoreConflict::GroupLocked)));
        assert_eq!(store.template(group.id).unwrap().unwrap().fields.len(), 1);
    }

    #[test]
    fn editing_a_missing_template_is_reported() {
        let store = Store::in_memory().unwrap();
        let group = Group::new("Course", None, 5, "instructor").unwrap();
        store.create_group(&group, Utc::now()).unwrap();
        let err = store
            .edit_template(group.id, |t| t.add_field("Name", FieldKind::Text, None))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict(StoreConflict::TemplateNotFound(id)) if id == group.id
        ));
    }

    #[test]
    fn closing_keeps_the_seat_count_and_stops_claims() {
        let store = Store::in_memory().unwrap();
        let group = active_group(&store, 5);
        store.insert_claim(&record_for(&group, "a@example.com")).unwrap();

        let closed = store.close_group(group.id).unwrap();
        assert_eq!(closed.status, GroupStatus::Completed);
        assert_eq!(closed.learner_count, 1);

        let err = store.insert_claim(&record_for(&group, "b@example.com")).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(StoreConflict::GroupNotActive)));
        let err = store.close_group(group.id).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(StoreConflict::Rejected(_))));
    }

    #[test]
    fn only_one_caller_holds_a_mint() {
        let store = Store::in_memory().unwrap();
        let group = active_group(&store, 5);
        let record = record_for(&group, "a@example.com");
        store.insert_claim(&record).unwrap();
        let now = Utc::now();
        let lease = Duration::minutes(10);

        let first = store
            .begin_mint(&record.certificate_id, "instructor", now, lease)
            .unwrap();
        assert!(matches!(first, Some(MintClaim::Started(_))));
        let second = store
            .begin_mint(&record.certificate_id, "instructor", now, lease)
            .unwrap();
        assert!(matches!(second, Some(MintClaim::InFlight(_))));
        assert_eq!(store.subscription("instructor").unwrap().unwrap().mint_credits, 4);

        // A holder that never reported back loses the mint once the lease ends.
        let later = store
            .begin_mint(&record.certificate_id, "instructor", now + Duration::minutes(11), lease)
            .unwrap();
        assert!(matches!(later, Some(MintClaim::Started(r)) if r.mint_attempts == 2));

        assert!(store
            .begin_mint("CERT-0-NOPE00", "instructor", now, lease)
            .unwrap()
            .is_none());
    }
}
