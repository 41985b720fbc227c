//! Bastion Test Utilities
//!
//! Shared test infrastructure for the Bastion workspace:
//! - A recording moderation gateway
//! - Proptest generators for rows, names and strike weights
//! - Fixtures wiring a `Database` and `EscalationLedger` over in-memory mocks
//! - Assertions for persisted table state
//! - Tracing setup for tests

// Re-export the in-memory transport from its source crate
pub use bastion_storage::{MockTransport, TransportStats};

pub use bastion_core::{
    BastionError, BastionResult, CodecError, EscalationPolicy, MessageId, ModerationError,
    PersistError, StorageConfig, TableError, Timestamp, TransportError, UserId,
    SNOWFLAKE_EPOCH_MS,
};
pub use bastion_moderation::{
    Attribution, AuditEntry, Escalation, EscalationLedger, ModerationGateway, Strike,
    TargetCapabilities, WarnOutcome,
};
pub use bastion_storage::{Column, ColumnKind, Database, Record, RowValues, Table, Value};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Install a `tracing` subscriber writing through the test harness.
///
/// Honours `RUST_LOG`; defaults to `warn`. Safe to call from every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MOCK GATEWAY
// ============================================================================

/// A call received by [`MockGateway`].
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayCall {
    AuditLog(AuditEntry),
    ModLog(String),
    Dm { user: UserId, text: String },
    Timeout { user: UserId, until: Timestamp, reason: String },
    Ban { user: UserId, reason: String },
}

#[derive(Debug, Default)]
struct GatewayState {
    calls: Vec<GatewayCall>,
    sequence: u64,
    capabilities: HashMap<UserId, TargetCapabilities>,
    timeouts: HashMap<UserId, Timestamp>,
    blocked_dms: HashSet<UserId>,
    deny_timeouts: bool,
    deny_bans: bool,
}

/// Recording [`ModerationGateway`].
///
/// Audit-log messages get realistic snowflake ids stamped with the current
/// time. Every member is bannable and moderatable unless configured
/// otherwise.
#[derive(Debug, Default)]
pub struct MockGateway {
    state: Mutex<GatewayState>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override what the bot may do to `user`.
    pub fn set_capabilities(&self, user: UserId, capabilities: TargetCapabilities) {
        lock(&self.state).capabilities.insert(user, capabilities);
    }

    /// Make direct messages to `user` fail.
    pub fn block_dms(&self, user: UserId) {
        lock(&self.state).blocked_dms.insert(user);
    }

    /// Make the platform refuse every timeout.
    pub fn deny_timeouts(&self) {
        lock(&self.state).deny_timeouts = true;
    }

    /// Make the platform refuse every ban.
    pub fn deny_bans(&self) {
        lock(&self.state).deny_bans = true;
    }

    /// Pretend `user` is already timed out until `until`.
    pub fn set_timeout(&self, user: UserId, until: Timestamp) {
        lock(&self.state).timeouts.insert(user, until);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        lock(&self.state).calls.clone()
    }

    /// Applied timeouts as `(user, until)`, in order.
    pub fn timeouts(&self) -> Vec<(UserId, Timestamp)> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                GatewayCall::Timeout { user, until, .. } => Some((*user, *until)),
                _ => None,
            })
            .collect()
    }

    /// Banned users, in order.
    pub fn bans(&self) -> Vec<UserId> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                GatewayCall::Ban { user, .. } => Some(*user),
                _ => None,
            })
            .collect()
    }

    pub fn mod_log(&self) -> Vec<String> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                GatewayCall::ModLog(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    /// Direct messages delivered to `user`.
    pub fn dms(&self, user: UserId) -> Vec<String> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                GatewayCall::Dm { user: to, text } if *to == user => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    fn next_snowflake(state: &mut GatewayState) -> MessageId {
        state.sequence += 1;
        let elapsed = (Utc::now().timestamp_millis() - SNOWFLAKE_EPOCH_MS).max(0) as u64;
        (elapsed << 22) | (state.sequence & 0x3f_ffff)
    }
}

fn denied(action: &str, user: UserId) -> ModerationError {
    ModerationError::PermissionDenied {
        action: action.to_string(),
        user_id: user,
    }
}

#[async_trait]
impl ModerationGateway for MockGateway {
    async fn post_audit_log(&self, entry: &AuditEntry) -> Result<MessageId, ModerationError> {
        let mut state = lock(&self.state);
        state.calls.push(GatewayCall::AuditLog(entry.clone()));
        Ok(Self::next_snowflake(&mut state))
    }

    async fn post_mod_log(&self, text: &str) -> Result<(), ModerationError> {
        lock(&self.state)
            .calls
            .push(GatewayCall::ModLog(text.to_string()));
        Ok(())
    }

    async fn send_dm(&self, user: UserId, text: &str) -> Result<(), ModerationError> {
        let mut state = lock(&self.state);
        if state.blocked_dms.contains(&user) {
            return Err(ModerationError::Gateway {
                reason: format!("user {} does not accept direct messages", user),
            });
        }
        state.calls.push(GatewayCall::Dm {
            user,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn capabilities(&self, user: UserId) -> Result<TargetCapabilities, ModerationError> {
        Ok(lock(&self.state)
            .capabilities
            .get(&user)
            .copied()
            .unwrap_or(TargetCapabilities {
                bannable: true,
                moderatable: true,
                outranks_baseline_role: false,
            }))
    }

    async fn current_timeout(&self, user: UserId) -> Result<Option<Timestamp>, ModerationError> {
        Ok(lock(&self.state).timeouts.get(&user).copied())
    }

    async fn apply_timeout(
        &self,
        user: UserId,
        until: Timestamp,
        reason: &str,
    ) -> Result<(), ModerationError> {
        let mut state = lock(&self.state);
        if state.deny_timeouts {
            return Err(denied("timeout", user));
        }
        state.timeouts.insert(user, until);
        state.calls.push(GatewayCall::Timeout {
            user,
            until,
            reason: reason.to_string(),
        });
        Ok(())
    }

    async fn apply_ban(&self, user: UserId, reason: &str) -> Result<(), ModerationError> {
        let mut state = lock(&self.state);
        if state.deny_bans {
            return Err(denied("ban", user));
        }
        state.calls.push(GatewayCall::Ban {
            user,
            reason: reason.to_string(),
        });
        Ok(())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Bastion rows and inputs.

    use super::fixtures::XpRow;
    use proptest::prelude::*;

    /// Valid table names.
    pub fn arb_table_name() -> impl Strategy<Value = String> {
        "[a-z0-9_-]{1,24}"
    }

    /// Text that stresses CSV quoting: delimiters, quotes, line breaks,
    /// padding and the empty string.
    pub fn arb_cell_text() -> impl Strategy<Value = String> {
        prop_oneof![
            Just(String::new()),
            Just(",".to_string()),
            Just("\"".to_string()),
            Just(" padded ".to_string()),
            "[a-z0-9 ,\"\n\r]{0,16}",
            any::<String>(),
        ]
    }

    pub fn arb_user_id() -> impl Strategy<Value = String> {
        "[1-9][0-9]{0,18}"
    }

    pub fn arb_xp_row() -> impl Strategy<Value = XpRow> {
        (arb_user_id(), any::<i64>()).prop_map(|(user, xp)| XpRow { user, xp })
    }

    pub fn arb_xp_rows() -> impl Strategy<Value = Vec<XpRow>> {
        prop::collection::vec(arb_xp_row(), 0..20)
    }

    /// Requested strike weights, including out-of-range ones.
    pub fn arb_strike_weight() -> impl Strategy<Value = f64> {
        prop_oneof![
            Just(0.0),
            Just(0.25),
            Just(1.0),
            -5.0f64..10.0,
        ]
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built records and wiring for common scenarios.

    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    /// Bot user id used by fixtures.
    pub const TEST_BOT_ID: UserId = 1000;

    /// Admin thread used by fixtures.
    pub const TEST_THREAD_ID: u64 = 77;

    /// Bot name written into fixture anchors.
    pub const TEST_BOT_NAME: &str = "BASTION";

    /// Experience points per user.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct XpRow {
        pub user: String,
        pub xp: i64,
    }

    impl XpRow {
        pub fn new(user: &str, xp: i64) -> Self {
            Self {
                user: user.to_string(),
                xp,
            }
        }
    }

    impl Record for XpRow {
        const COLUMNS: &'static [Column] = &[
            Column::required("user", ColumnKind::Text),
            Column::required("xp", ColumnKind::Integer),
        ];

        fn to_values(&self) -> Vec<Value> {
            vec![self.user.clone().into(), self.xp.into()]
        }

        fn from_values(row: RowValues<'_>) -> Result<Self, CodecError> {
            Ok(Self {
                user: row.text("user")?,
                xp: row.integer("xp")?,
            })
        }
    }

    /// Storage config pointing at the fixture thread.
    pub fn test_config() -> StorageConfig {
        StorageConfig::new(TEST_BOT_NAME, TEST_THREAD_ID)
    }

    /// Storage config with a custom quiescence window.
    pub fn test_config_with_quiescence(quiescence: Duration) -> StorageConfig {
        test_config().with_quiescence(quiescence)
    }

    /// A mock transport with the fixture thread in place.
    pub fn test_transport() -> Arc<MockTransport> {
        let transport = Arc::new(MockTransport::new(TEST_BOT_ID));
        transport.add_thread(TEST_THREAD_ID);
        transport
    }

    /// A connected database over a fresh mock transport.
    pub async fn test_database() -> BastionResult<(Arc<MockTransport>, Database)> {
        let transport = test_transport();
        let db = Database::connect(transport.clone(), test_config()).await?;
        Ok((transport, db))
    }

    /// Everything a ledger test needs.
    pub struct LedgerHarness {
        pub transport: Arc<MockTransport>,
        pub gateway: Arc<MockGateway>,
        pub db: Database,
        pub ledger: EscalationLedger,
    }

    /// A ledger with the default policy over fresh mocks.
    pub async fn test_ledger() -> BastionResult<LedgerHarness> {
        test_ledger_with_policy(EscalationPolicy::default()).await
    }

    pub async fn test_ledger_with_policy(policy: EscalationPolicy) -> BastionResult<LedgerHarness> {
        let (transport, db) = test_database().await?;
        let gateway = Arc::new(MockGateway::new());
        let ledger = EscalationLedger::open(&db, gateway.clone(), policy).await?;
        Ok(LedgerHarness {
            transport,
            gateway,
            db,
            ledger,
        })
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on what the mock transport has persisted.

    use super::*;
    use bastion_storage::decode_rows;

    /// Decode the rows currently attached to a table's anchor.
    #[track_caller]
    pub fn persisted_rows<R: Record>(transport: &MockTransport, table: &Table<R>) -> Vec<R> {
        let anchor = match table.anchor_id() {
            Some(anchor) => anchor,
            None => panic!("table {} has no anchor", table.name()),
        };
        let bytes = transport.attachment_bytes(anchor);
        match decode_rows::<R>(bytes.as_deref()) {
            Ok(rows) => rows,
            Err(err) => panic!("persisted rows of {} do not decode: {}", table.name(), err),
        }
    }

    /// Assert the persisted rows of a table.
    #[track_caller]
    pub fn assert_persisted<R: Record + PartialEq + std::fmt::Debug>(
        transport: &MockTransport,
        table: &Table<R>,
        expected: &[R],
    ) {
        assert_eq!(persisted_rows(transport, table), expected);
    }

    /// Assert a table's anchor carries no attachment.
    #[track_caller]
    pub fn assert_no_attachment<R: Record>(transport: &MockTransport, table: &Table<R>) {
        let anchor = table.anchor_id();
        let bytes = anchor.and_then(|id| transport.attachment_bytes(id));
        assert!(
            bytes.is_none(),
            "expected no attachment on {}, found {:?}",
            table.name(),
            bytes.map(|b| String::from_utf8_lossy(&b).into_owned())
        );
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_storage::{decode_rows, encode_rows};
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_gateway_snowflakes_are_increasing_and_current() {
        let gateway = MockGateway::new();
        let entry = AuditEntry {
            user: 1,
            reason: "spam".to_string(),
            weight: 1.0,
            total: 1.0,
            attribution: Attribution::Moderator(2),
        };
        let first = gateway.post_audit_log(&entry).await.unwrap();
        let second = gateway.post_audit_log(&entry).await.unwrap();
        assert!(second > first);

        let age = Utc::now() - bastion_core::snowflake_timestamp(second);
        assert!(age.num_seconds().abs() < 60);
    }

    #[tokio::test]
    async fn test_gateway_permission_toggles() {
        let gateway = MockGateway::new();
        gateway.deny_timeouts();
        gateway.deny_bans();
        assert!(matches!(
            gateway.apply_timeout(1, Utc::now(), "x").await,
            Err(ModerationError::PermissionDenied { .. })
        ));
        assert!(gateway.apply_ban(1, "x").await.is_err());
        assert!(gateway.timeouts().is_empty());
        assert!(gateway.bans().is_empty());
    }

    #[tokio::test]
    async fn test_fixture_database_connects() {
        let (transport, db) = fixtures::test_database().await.unwrap();
        assert_eq!(db.config().admin_thread_id, fixtures::TEST_THREAD_ID);
        assert_eq!(transport.stats().recent_fetches, 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn prop_xp_rows_round_trip(rows in generators::arb_xp_rows()) {
            let encoded = encode_rows(&rows);
            prop_assert_eq!(encoded.is_none(), rows.is_empty());
            let decoded = decode_rows::<fixtures::XpRow>(encoded.as_deref()).unwrap();
            prop_assert_eq!(decoded, rows);
        }

        #[test]
        fn prop_generated_table_names_are_valid(name in generators::arb_table_name()) {
            prop_assert!(bastion_storage::validate_table_name(&name).is_ok());
        }
    }
}
