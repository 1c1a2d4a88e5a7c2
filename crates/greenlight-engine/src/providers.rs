//! Egress interfaces.
//!
//! Everything the engine touches outside its own log lives behind one of
//! these traits, and every call happens inside a step, so providers see
//! at-least-once invocation and must honor the idempotency keys they are
//! handed. The in-memory implementations are the reference semantics and
//! the test doubles: they record calls for assertions and support
//! scripted failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use greenlight_types::{
    EventName, InstanceId, Payload, StepError, TemplateComplexity, WorkflowKind,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

// ── Rows and records ──

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub email_verified: bool,
    pub phone_verified: bool,
    pub identity_verified: bool,
    pub account_age_days: u32,
    pub trust_score: u32,
    pub accredited: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PitchRecord {
    pub id: String,
    pub creator_id: String,
    pub title: String,
    pub total_funded: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub id: String,
    pub verified: bool,
    pub active_projects: usize,
}

/// A deal or NDA row as the relational store sees it. `deal_id` is the
/// instance id in full hex; `instance` lets the engine route waitlist
/// promotions back to the owning workflow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DealRow {
    pub deal_id: String,
    pub instance: InstanceId,
    pub kind: WorkflowKind,
    pub pitch_id: String,
    pub party_id: String,
    pub state: String,
    pub exclusivity_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NdaHistory {
    pub prior_breaches: u32,
    pub prior_disputes: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateInfo {
    pub id: String,
    pub complexity: TemplateComplexity,
    pub clause_count: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Push,
    InApp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: String,
    pub recipient_id: String,
    pub channels: Vec<Channel>,
    pub priority: Priority,
}

// ── Traits ──

/// Relational store of business entities. Read-your-writes within a step
/// boundary.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_user(&self, id: &str) -> Result<UserRecord, StepError>;
    async fn get_pitch(&self, id: &str) -> Result<PitchRecord, StepError>;
    async fn get_company(&self, id: &str) -> Result<CompanyRecord, StepError>;

    async fn upsert_deal(&self, row: DealRow) -> Result<(), StepError>;
    async fn update_deal_state(&self, deal_id: &str, state: &str) -> Result<(), StepError>;
    async fn set_exclusivity(
        &self,
        deal_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StepError>;
    async fn deals_for_pitch(&self, pitch_id: &str) -> Result<Vec<DealRow>, StepError>;

    async fn active_nda_exists(
        &self,
        pitch_id: &str,
        requester_id: &str,
    ) -> Result<bool, StepError>;
    async fn nda_history(&self, requester_id: &str) -> Result<NdaHistory, StepError>;

    async fn add_pitch_funding(&self, pitch_id: &str, amount: u64) -> Result<u64, StepError>;

    async fn grant_pitch_access(
        &self,
        pitch_id: &str,
        party_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StepError>;
    async fn revoke_pitch_access(&self, pitch_id: &str, party_id: &str)
    -> Result<(), StepError>;
}

/// Object store for generated documents. Overwrites are idempotent.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StepError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StepError>;
}

#[async_trait]
pub trait TemplateStore: Send + Sync {
    async fn get_template(&self, id: &str) -> Result<Option<TemplateInfo>, StepError>;
}

/// Payment rail. `hold_funds` is idempotent on the key derived from
/// step name × instance id.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn hold_funds(
        &self,
        idempotency_key: &str,
        amount: u64,
        metadata: Payload,
    ) -> Result<String, StepError>;
    async fn release_funds(&self, intent_id: &str) -> Result<(), StepError>;
    async fn refund(&self, intent_id: &str) -> Result<(), StepError>;
}

/// E-signature rail. Envelope webhooks come back through ingress as
/// `envelope-status` events.
#[async_trait]
pub trait SignatureProvider: Send + Sync {
    async fn create_envelope(
        &self,
        idempotency_key: &str,
        template_id: &str,
        recipients: Vec<String>,
        metadata: Payload,
    ) -> Result<String, StepError>;
    async fn void_envelope(&self, envelope_id: &str) -> Result<(), StepError>;
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn enqueue(&self, notification: Notification) -> Result<(), StepError>;
}

/// Engine-internal egress: deliver an event to another instance's
/// mailbox. Used by exclusivity release to wake the promoted waitlisted
/// deal.
#[async_trait]
pub trait InstanceNotifier: Send + Sync {
    async fn deliver(
        &self,
        instance: InstanceId,
        name: EventName,
        payload: Payload,
    ) -> Result<(), StepError>;
}

/// The bundle handed to machines and the compensation runner.
#[derive(Clone)]
pub struct ProviderSet {
    pub entities: Arc<dyn EntityStore>,
    pub documents: Arc<dyn DocumentStore>,
    pub templates: Arc<dyn TemplateStore>,
    pub payments: Arc<dyn PaymentProvider>,
    pub signatures: Arc<dyn SignatureProvider>,
    pub notifications: Arc<dyn NotificationSink>,
    pub peers: Arc<dyn InstanceNotifier>,
}

// ── In-memory implementations ──

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Default)]
struct EntityInner {
    users: HashMap<String, UserRecord>,
    pitches: HashMap<String, PitchRecord>,
    companies: HashMap<String, CompanyRecord>,
    deals: HashMap<String, DealRow>,
    nda_histories: HashMap<String, NdaHistory>,
    active_ndas: HashSet<(String, String)>,
    access_grants: HashMap<(String, String), DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryEntityStore {
    inner: Mutex<EntityInner>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, user: UserRecord) -> Self {
        lock(&self.inner).users.insert(user.id.clone(), user);
        self
    }

    pub fn with_pitch(self, pitch: PitchRecord) -> Self {
        lock(&self.inner).pitches.insert(pitch.id.clone(), pitch);
        self
    }

    pub fn with_company(self, company: CompanyRecord) -> Self {
        lock(&self.inner)
            .companies
            .insert(company.id.clone(), company);
        self
    }

    pub fn with_nda_history(self, requester_id: &str, history: NdaHistory) -> Self {
        lock(&self.inner)
            .nda_histories
            .insert(requester_id.to_string(), history);
        self
    }

    pub fn with_active_nda(self, pitch_id: &str, requester_id: &str) -> Self {
        lock(&self.inner)
            .active_ndas
            .insert((pitch_id.to_string(), requester_id.to_string()));
        self
    }

    pub fn pitch(&self, id: &str) -> Option<PitchRecord> {
        lock(&self.inner).pitches.get(id).cloned()
    }

    pub fn deal(&self, deal_id: &str) -> Option<DealRow> {
        lock(&self.inner).deals.get(deal_id).cloned()
    }

    pub fn access_grant(&self, pitch_id: &str, party_id: &str) -> Option<DateTime<Utc>> {
        lock(&self.inner)
            .access_grants
            .get(&(pitch_id.to_string(), party_id.to_string()))
            .copied()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn get_user(&self, id: &str) -> Result<UserRecord, StepError> {
        lock(&self.inner)
            .users
            .get(id)
            .cloned()
            .ok_or_else(|| StepError::domain(format!("unknown user '{id}'")))
    }

    async fn get_pitch(&self, id: &str) -> Result<PitchRecord, StepError> {
        lock(&self.inner)
            .pitches
            .get(id)
            .cloned()
            .ok_or_else(|| StepError::domain(format!("unknown pitch '{id}'")))
    }

    async fn get_company(&self, id: &str) -> Result<CompanyRecord, StepError> {
        lock(&self.inner)
            .companies
            .get(id)
            .cloned()
            .ok_or_else(|| StepError::domain(format!("unknown company '{id}'")))
    }

    async fn upsert_deal(&self, row: DealRow) -> Result<(), StepError> {
        lock(&self.inner).deals.insert(row.deal_id.clone(), row);
        Ok(())
    }

    async fn update_deal_state(&self, deal_id: &str, state: &str) -> Result<(), StepError> {
        let mut inner = lock(&self.inner);
        let deal = inner
            .deals
            .get_mut(deal_id)
            .ok_or_else(|| StepError::domain(format!("unknown deal '{deal_id}'")))?;
        deal.state = state.to_string();
        Ok(())
    }

    async fn set_exclusivity(
        &self,
        deal_id: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StepError> {
        let mut inner = lock(&self.inner);
        let deal = inner
            .deals
            .get_mut(deal_id)
            .ok_or_else(|| StepError::domain(format!("unknown deal '{deal_id}'")))?;
        deal.exclusivity_expires_at = expires_at;
        Ok(())
    }

    async fn deals_for_pitch(&self, pitch_id: &str) -> Result<Vec<DealRow>, StepError> {
        let mut rows: Vec<DealRow> = lock(&self.inner)
            .deals
            .values()
            .filter(|d| d.pitch_id == pitch_id)
            .cloned()
            .collect();
        rows.sort_by_key(|d| (d.created_at, d.deal_id.clone()));
        Ok(rows)
    }

    async fn active_nda_exists(
        &self,
        pitch_id: &str,
        requester_id: &str,
    ) -> Result<bool, StepError> {
        Ok(lock(&self.inner)
            .active_ndas
            .contains(&(pitch_id.to_string(), requester_id.to_string())))
    }

    async fn nda_history(&self, requester_id: &str) -> Result<NdaHistory, StepError> {
        Ok(lock(&self.inner)
            .nda_histories
            .get(requester_id)
            .copied()
            .unwrap_or_default())
    }

    async fn add_pitch_funding(&self, pitch_id: &str, amount: u64) -> Result<u64, StepError> {
        let mut inner = lock(&self.inner);
        let pitch = inner
            .pitches
            .get_mut(pitch_id)
            .ok_or_else(|| StepError::domain(format!("unknown pitch '{pitch_id}'")))?;
        pitch.total_funded += amount;
        Ok(pitch.total_funded)
    }

    async fn grant_pitch_access(
        &self,
        pitch_id: &str,
        party_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StepError> {
        let mut inner = lock(&self.inner);
        inner
            .access_grants
            .insert((pitch_id.to_string(), party_id.to_string()), expires_at);
        inner
            .active_ndas
            .insert((pitch_id.to_string(), party_id.to_string()));
        Ok(())
    }

    async fn revoke_pitch_access(
        &self,
        pitch_id: &str,
        party_id: &str,
    ) -> Result<(), StepError> {
        let mut inner = lock(&self.inner);
        inner
            .access_grants
            .remove(&(pitch_id.to_string(), party_id.to_string()));
        inner
            .active_ndas
            .remove(&(pitch_id.to_string(), party_id.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.docs).keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StepError> {
        lock(&self.docs).insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StepError> {
        Ok(lock(&self.docs).get(key).cloned())
    }
}

pub struct MemoryTemplateStore {
    templates: Mutex<HashMap<String, TemplateInfo>>,
}

impl Default for MemoryTemplateStore {
    fn default() -> Self {
        // The two stock templates every deployment ships with.
        let mut templates = HashMap::new();
        templates.insert(
            "standard".to_string(),
            TemplateInfo {
                id: "standard".to_string(),
                complexity: TemplateComplexity::Standard,
                clause_count: 12,
            },
        );
        templates.insert(
            "enhanced".to_string(),
            TemplateInfo {
                id: "enhanced".to_string(),
                complexity: TemplateComplexity::Enhanced,
                clause_count: 21,
            },
        );
        Self {
            templates: Mutex::new(templates),
        }
    }
}

impl MemoryTemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_template(self, template: TemplateInfo) -> Self {
        lock(&self.templates).insert(template.id.clone(), template);
        self
    }
}

#[async_trait]
impl TemplateStore for MemoryTemplateStore {
    async fn get_template(&self, id: &str) -> Result<Option<TemplateInfo>, StepError> {
        Ok(lock(&self.templates).get(id).cloned())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntentRecord {
    pub intent_id: String,
    pub idempotency_key: String,
    pub amount: u64,
    pub refunded: bool,
    pub released: bool,
}

#[derive(Default)]
struct PaymentInner {
    by_key: HashMap<String, String>,
    intents: HashMap<String, IntentRecord>,
    scripted_hold_failures: VecDeque<StepError>,
}

/// Records every hold/release/refund; `script_hold_failure` makes the
/// next `hold_funds` call fail once.
#[derive(Default)]
pub struct MemoryPaymentProvider {
    inner: Mutex<PaymentInner>,
}

impl MemoryPaymentProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_hold_failure(&self, error: StepError) {
        lock(&self.inner).scripted_hold_failures.push_back(error);
    }

    pub fn intents(&self) -> Vec<IntentRecord> {
        let mut intents: Vec<IntentRecord> =
            lock(&self.inner).intents.values().cloned().collect();
        intents.sort_by_key(|i| i.intent_id.clone());
        intents
    }

    pub fn intent(&self, intent_id: &str) -> Option<IntentRecord> {
        lock(&self.inner).intents.get(intent_id).cloned()
    }
}

#[async_trait]
impl PaymentProvider for MemoryPaymentProvider {
    async fn hold_funds(
        &self,
        idempotency_key: &str,
        amount: u64,
        _metadata: Payload,
    ) -> Result<String, StepError> {
        let mut inner = lock(&self.inner);
        if let Some(error) = inner.scripted_hold_failures.pop_front() {
            return Err(error);
        }
        // Same key, same intent: at-least-once callers must land here.
        if let Some(existing) = inner.by_key.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let intent_id = format!("pi_{}", uuid::Uuid::new_v4().simple());
        inner
            .by_key
            .insert(idempotency_key.to_string(), intent_id.clone());
        inner.intents.insert(
            intent_id.clone(),
            IntentRecord {
                intent_id: intent_id.clone(),
                idempotency_key: idempotency_key.to_string(),
                amount,
                refunded: false,
                released: false,
            },
        );
        Ok(intent_id)
    }

    async fn release_funds(&self, intent_id: &str) -> Result<(), StepError> {
        let mut inner = lock(&self.inner);
        let intent = inner
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| StepError::domain(format!("unknown intent '{intent_id}'")))?;
        intent.released = true;
        Ok(())
    }

    async fn refund(&self, intent_id: &str) -> Result<(), StepError> {
        let mut inner = lock(&self.inner);
        let intent = inner
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| StepError::domain(format!("unknown intent '{intent_id}'")))?;
        intent.refunded = true;
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvelopeRecord {
    pub envelope_id: String,
    pub idempotency_key: String,
    pub template_id: String,
    pub recipients: Vec<String>,
    pub voided: bool,
}

#[derive(Default)]
struct SignatureInner {
    by_key: HashMap<String, String>,
    envelopes: HashMap<String, EnvelopeRecord>,
}

#[derive(Default)]
pub struct MemorySignatureProvider {
    inner: Mutex<SignatureInner>,
}

impl MemorySignatureProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelopes(&self) -> Vec<EnvelopeRecord> {
        let mut envelopes: Vec<EnvelopeRecord> =
            lock(&self.inner).envelopes.values().cloned().collect();
        envelopes.sort_by_key(|e| e.envelope_id.clone());
        envelopes
    }
}

#[async_trait]
impl SignatureProvider for MemorySignatureProvider {
    async fn create_envelope(
        &self,
        idempotency_key: &str,
        template_id: &str,
        recipients: Vec<String>,
        _metadata: Payload,
    ) -> Result<String, StepError> {
        let mut inner = lock(&self.inner);
        if let Some(existing) = inner.by_key.get(idempotency_key) {
            return Ok(existing.clone());
        }
        let envelope_id = format!("env_{}", uuid::Uuid::new_v4().simple());
        inner
            .by_key
            .insert(idempotency_key.to_string(), envelope_id.clone());
        inner.envelopes.insert(
            envelope_id.clone(),
            EnvelopeRecord {
                envelope_id: envelope_id.clone(),
                idempotency_key: idempotency_key.to_string(),
                template_id: template_id.to_string(),
                recipients,
                voided: false,
            },
        );
        Ok(envelope_id)
    }

    async fn void_envelope(&self, envelope_id: &str) -> Result<(), StepError> {
        let mut inner = lock(&self.inner);
        let envelope = inner
            .envelopes
            .get_mut(envelope_id)
            .ok_or_else(|| StepError::domain(format!("unknown envelope '{envelope_id}'")))?;
        envelope.voided = true;
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryNotificationSink {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl NotificationSink for MemoryNotificationSink {
    async fn enqueue(&self, notification: Notification) -> Result<(), StepError> {
        lock(&self.sent).push(notification);
        Ok(())
    }
}

/// Notifier that drops everything. For unit tests exercising a machine
/// outside a full engine.
#[derive(Default)]
pub struct NullNotifier;

#[async_trait]
impl InstanceNotifier for NullNotifier {
    async fn deliver(
        &self,
        _instance: InstanceId,
        _name: EventName,
        _payload: Payload,
    ) -> Result<(), StepError> {
        Ok(())
    }
}
