//! Instructor plans, mint credits and the subscription API.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    store::StoreConflict, ApiError, AppState, CODE_INSTRUCTOR_NOT_FOUND, CODE_INVALID_INPUT,
    CODE_INVALID_PACKAGE,
};

pub const FREE_GROUP_LIMIT: u32 = 2;
pub const FREE_MINT_CREDITS: u32 = 5;
pub const PRO_GROUP_LIMIT: u32 = 50;
pub const PRO_MONTHLY_CREDITS: u32 = 100;
pub const PRO_MONTHLY_PRICE: f64 = 29.99;
const DAYS_PER_BILLING_MONTH: i64 = 30;
const MAX_UPGRADE_MONTHS: u32 = 24;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct CreditPackage {
    pub id: &'static str,
    pub credits: u32,
    pub price: f64,
}

pub const CREDIT_PACKAGES: [CreditPackage; 5] = [
    CreditPackage { id: "starter", credits: 50, price: 9.99 },
    CreditPackage { id: "basic", credits: 120, price: 19.99 },
    CreditPackage { id: "standard", credits: 300, price: 44.99 },
    CreditPackage { id: "premium", credits: 750, price: 99.99 },
    CreditPackage { id: "enterprise", credits: 2000, price: 249.99 },
];

pub fn find_package(id: &str) -> Option<&'static CreditPackage> {
    CREDIT_PACKAGES
        .iter()
        .find(|package| package.id.eq_ignore_ascii_case(id.trim()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Pro,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: String,
    pub tier: SubscriptionTier,
    pub expires_at: Option<DateTime<Utc>>,
    pub mint_credits: u32,
    pub groups_created: u32,
    pub total_certificates_issued: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn free(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            tier: SubscriptionTier::Free,
            expires_at: None,
            mint_credits: FREE_MINT_CREDITS,
            groups_created: 0,
            total_certificates_issued: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The tier limits are enforced against; lapsed Pro plans count as Free.
    pub fn effective_tier(&self, now: DateTime<Utc>) -> SubscriptionTier {
        match (self.tier, self.expires_at) {
            (SubscriptionTier::Pro, Some(expires_at)) if expires_at > now => SubscriptionTier::Pro,
            _ => SubscriptionTier::Free,
        }
    }

    pub fn is_pro(&self, now: DateTime<Utc>) -> bool {
        self.effective_tier(now) == SubscriptionTier::Pro
    }

    pub fn groups_limit(&self, now: DateTime<Utc>) -> u32 {
        match self.effective_tier(now) {
            SubscriptionTier::Free => FREE_GROUP_LIMIT,
            SubscriptionTier::Pro => PRO_GROUP_LIMIT,
        }
    }

    pub fn can_create_group(&self, now: DateTime<Utc>) -> bool {
        self.groups_created < self.groups_limit(now)
    }

    pub fn can_mint(&self, count: u32) -> bool {
        self.mint_credits >= count
    }

    pub fn debit(&mut self, count: u32) -> Result<(), StoreConflict> {
        if !self.can_mint(count) {
            return Err(StoreConflict::NoCredits);
        }
        self.mint_credits -= count;
        Ok(())
    }

    pub fn refund(&mut self, count: u32) {
        self.mint_credits = self.mint_credits.saturating_add(count);
    }

    /// Extend Pro by `months` from the later of now and the current expiry.
    pub fn upgrade(&mut self, months: u32, now: DateTime<Utc>) {
        let start = match self.expires_at {
            Some(expires_at) if expires_at > now => expires_at,
            _ => now,
        };
        self.tier = SubscriptionTier::Pro;
        self.expires_at = Some(start + Duration::days(DAYS_PER_BILLING_MONTH * i64::from(months)));
        self.mint_credits = self
            .mint_credits
            .saturating_add(PRO_MONTHLY_CREDITS.saturating_mul(months));
    }
}

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/subscription/packages", get(list_packages))
        .route("/api/subscription/status/:user_id", get(subscription_status))
        .route(
            "/api/subscription/check-group-limit/:user_id",
            post(check_group_limit),
        )
        .route(
            "/api/subscription/check-mint-limit/:user_id",
            post(check_mint_limit),
        )
        .route("/api/subscription/upgrade", post(upgrade))
        .route("/api/subscription/purchase-credits", post(purchase_credits))
}

#[derive(Serialize)]
struct PackageView {
    credits: u32,
    price: f64,
}

#[derive(Serialize)]
struct FreeLimits {
    groups: u32,
    mint_credits: u32,
}

#[derive(Serialize)]
struct ProPlan {
    groups: u32,
    monthly_credits: u32,
    price_per_month: f64,
}

#[derive(Serialize)]
struct PackagesResponse {
    packages: BTreeMap<&'static str, PackageView>,
    free_limits: FreeLimits,
    pro: ProPlan,
}

async fn list_packages() -> Json<PackagesResponse> {
    let packages = CREDIT_PACKAGES
        .iter()
        .map(|p| {
            (
                p.id,
                PackageView {
                    credits: p.credits,
                    price: p.price,
                },
            )
        })
        .collect();
    Json(PackagesResponse {
        packages,
        free_limits: FreeLimits {
            groups: FREE_GROUP_LIMIT,
            mint_credits: FREE_MINT_CREDITS,
        },
        pro: ProPlan {
            groups: PRO_GROUP_LIMIT,
            monthly_credits: PRO_MONTHLY_CREDITS,
            price_per_month: PRO_MONTHLY_PRICE,
        },
    })
}

fn load_or_free(state: &AppState, user_id: &str, now: DateTime<Utc>) -> Result<Subscription, ApiError> {
    Ok(state
        .store()
        .subscription(user_id)?
        .unwrap_or_else(|| Subscription::free(user_id, now)))
}

#[derive(Serialize)]
struct StatusResponse {
    subscription_type: SubscriptionTier,
    is_pro: bool,
    subscription_expires_at: Option<DateTime<Utc>>,
    is_active: bool,
    mint_credits: u32,
    groups_created: u32,
    groups_limit: u32,
    can_create_group: bool,
    can_mint: bool,
    total_certificates_issued: u64,
}

async fn subscription_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let now = Utc::now();
    let subscription = load_or_free(&state, &user_id, now)?;
    let is_pro = subscription.is_pro(now);
    Ok(Json(StatusResponse {
        subscription_type: subscription.effective_tier(now),
        is_pro,
        subscription_expires_at: subscription.expires_at,
        is_active: subscription.tier == SubscriptionTier::Free || is_pro,
        mint_credits: subscription.mint_credits,
        groups_created: subscription.groups_created,
        groups_limit: subscription.groups_limit(now),
        can_create_group: subscription.can_create_group(now),
        can_mint: subscription.can_mint(1),
        total_certificates_issued: subscription.total_certificates_issued,
    }))
}

#[derive(Serialize)]
struct GroupLimitResponse {
    allowed: bool,
    groups_created: u32,
    groups_limit: u32,
    subscription_type: SubscriptionTier,
}

async fn check_group_limit(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<GroupLimitResponse>, ApiError> {
    let now = Utc::now();
    let subscription = load_or_free(&state, &user_id, now)?;
    Ok(Json(GroupLimitResponse {
        allowed: subscription.can_create_group(now),
        groups_created: subscription.groups_created,
        groups_limit: subscription.groups_limit(now),
        subscription_type: subscription.effective_tier(now),
    }))
}

#[derive(Debug, Deserialize)]
struct MintLimitQuery {
    count: Option<u32>,
}

#[derive(Serialize)]
struct MintLimitResponse {
    allowed: bool,
    current_credits: u32,
    requested: u32,
    subscription_type: SubscriptionTier,
    message: String,
}

async fn check_mint_limit(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(query): Query<MintLimitQuery>,
) -> Result<Json<MintLimitResponse>, ApiError> {
    let now = Utc::now();
    let requested = query.count.unwrap_or(1);
    if requested == 0 {
        return Err(ApiError::bad_request(CODE_INVALID_INPUT, "count must be at least 1"));
    }
    let subscription = load_or_free(&state, &user_id, now)?;
    let allowed = subscription.can_mint(requested);
    let message = if allowed {
        format!(
            "{requested} mint credit(s) available of {}",
            subscription.mint_credits
        )
    } else {
        format!(
            "Insufficient credits: {requested} requested, {} remaining",
            subscription.mint_credits
        )
    };
    Ok(Json(MintLimitResponse {
        allowed,
        current_credits: subscription.mint_credits,
        requested,
        subscription_type: subscription.effective_tier(now),
        message,
    }))
}

fn require_instructor(state: &AppState, user_id: &str) -> Result<(), ApiError> {
    if state.store().instructor(user_id)?.is_none() {
        return Err(ApiError::not_found(
            CODE_INSTRUCTOR_NOT_FOUND,
            format!("user {user_id} is not an instructor"),
        ));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct UpgradeRequest {
    user_id: String,
    #[serde(default = "default_months")]
    duration_months: u32,
}

fn default_months() -> u32 {
    1
}

#[derive(Serialize)]
struct UpgradeResponse {
    success: bool,
    subscription_type: SubscriptionTier,
    subscription_expires_at: Option<DateTime<Utc>>,
    mint_credits: u32,
    message: String,
}

async fn upgrade(
    State(state): State<AppState>,
    Json(request): Json<UpgradeRequest>,
) -> Result<Json<UpgradeResponse>, ApiError> {
    let months = request.duration_months;
    if !(1..=MAX_UPGRADE_MONTHS).contains(&months) {
        return Err(ApiError::bad_request(
            CODE_INVALID_INPUT,
            format!("duration_months must be between 1 and {MAX_UPGRADE_MONTHS}"),
        ));
    }
    require_instructor(&state, &request.user_id)?;

    let now = Utc::now();
    let subscription = state
        .store()
        .update_subscription(&request.user_id, now, |subscription| {
            subscription.upgrade(months, now);
            Ok(())
        })?;
    info!(user_id = %request.user_id, months, "upgraded to pro");

    Ok(Json(UpgradeResponse {
        success: true,
        subscription_type: SubscriptionTier::Pro,
        subscription_expires_at: subscription.expires_at,
        mint_credits: subscription.mint_credits,
        message: format!(
            "Upgraded to Pro for {months} month(s); {} credits added",
            PRO_MONTHLY_CREDITS * months
        ),
    }))
}

#[derive(Debug, Deserialize)]
struct PurchaseRequest {
    user_id: String,
    package: String,
}

#[derive(Serialize)]
struct PurchaseResponse {
    success: bool,
    package: &'static str,
    credits_added: u32,
    mint_credits: u32,
    message: String,
}

async fn purchase_credits(
    State(state): State<AppState>,
    Json(request): Json<PurchaseRequest>,
) -> Result<Json<PurchaseResponse>, ApiError> {
    require_instructor(&state, &request.user_id)?;
    let package = find_package(&request.package).ok_or_else(|| {
        ApiError::bad_request(
            CODE_INVALID_PACKAGE,
            format!("unknown credit package '{}'", request.package),
        )
    })?;

    let subscription = state
        .store()
        .update_subscription(&request.user_id, Utc::now(), |subscription| {
            subscription.refund(package.credits);
            Ok(())
        })?;
    info!(user_id = %request.user_id, package = package.id, "purchased mint credits");

    Ok(Json(PurchaseResponse {
        success: true,
        package: package.id,
        credits_added: package.credits,
        mint_credits: subscription.mint_credits,
        message: format!("Added {} mint credits", package.credits),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_tier_defaults() {
        let now = Utc::now();
        let sub = Subscription::free("u", now);
        assert_eq!(sub.groups_limit(now), FREE_GROUP_LIMIT);
        assert_eq!(sub.mint_credits, FREE_MINT_CREDITS);
        assert!(sub.can_create_group(now));
        assert!(!sub.is_pro(now));
    }

    #[test]
    fn upgrade_extends_from_existing_expiry() {
        let now = Utc::now();
        let mut sub = Subscription::free("u", now);
        sub.upgrade(1, now);
        let first = sub.expires_at.unwrap();
        assert_eq!(first, now + Duration::days(30));
        assert_eq!(sub.mint_credits, FREE_MINT_CREDITS + PRO_MONTHLY_CREDITS);

        sub.upgrade(2, now);
        assert_eq!(sub.expires_at.unwrap(), first + Duration::days(60));
        assert_eq!(sub.groups_limit(now), PRO_GROUP_LIMIT);
    }

    #[test]
    fn lapsed_pro_counts_as_free() {
        let now = Utc::now();
        let mut sub = Subscription::free("u", now);
        sub.upgrade(1, now - Duration::days(90));
        assert_eq!(sub.tier, SubscriptionTier::Pro);
        assert_eq!(sub.effective_tier(now), SubscriptionTier::Free);
        assert_eq!(sub.groups_limit(now), FREE_GROUP_LIMIT);
    }

    #[test]
    fn debit_refuses_overdraft() {
        let mut sub = Subscription::free("u", Utc::now());
        assert!(sub.debit(5).is_ok());
        assert!(matches!(sub.debit(1), Err(StoreConflict::NoCredits)));
        sub.refund(1);
        assert!(sub.can_mint(1));
    }

    #[test]
    fn packages_are_found_case_insensitively() {
        assert_eq!(find_package("Starter").unwrap().credits, 50);
        assert_eq!(find_package("enterprise").unwrap().price, 249.99);
        assert!(find_package("invalid_package").is_none());
    }
}
