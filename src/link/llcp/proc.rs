//! Control procedure bookkeeping.
//!
//! At most one *locally initiated* control procedure can run on a connection at a time. Further
//! requests are parked in a pending set and started in request order once the current procedure
//! finishes. The [`ProcedureEngine`] tracks the current procedure, its response timeout, the
//! pending set, and the results of the one-shot exchanges (peer features and version).
//!
//! The engine only does bookkeeping. Building the actual LL Control PDUs and reacting to the
//! peer's responses is the connection's job.

use {
    crate::{
        host::{Role, StatusCode},
        link::{
            comp_id::CompanyId,
            features::FeatureSet,
            llcp::{ControlOpcode, VersionNumber},
        },
        time::{Duration, Instant},
    },
    bitflags::bitflags,
};

/// Response timeout for control procedures (`T_prt`).
///
/// When the peer does not conclude a procedure within this time, the connection is considered
/// dead and must be terminated with `LmpResponseTimeout`.
const PROCEDURE_TIMEOUT: Duration = Duration::from_micros(40_000_000);

/// The control procedures a connection can initiate.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProcedureId {
    /// Connection Update procedure (master only).
    ConnectionUpdate,
    /// Channel Map Update procedure (master only).
    ChannelMapUpdate,
    /// Termination procedure.
    Terminate,
    /// Encryption Start procedure.
    EncryptionStart,
    /// Encryption Pause procedure.
    EncryptionPause,
    /// Feature Exchange procedure (either role).
    FeatureExchange,
    /// Version Exchange procedure.
    VersionExchange,
    /// Connection Parameters Request procedure.
    ConnParamRequest,
    /// LE Ping procedure.
    Ping,
    /// Data Length Update procedure.
    DataLengthUpdate,
}

impl ProcedureId {
    fn flag(&self) -> PendingProcedures {
        match self {
            ProcedureId::ConnectionUpdate => PendingProcedures::CONN_UPDATE,
            ProcedureId::ChannelMapUpdate => PendingProcedures::CHAN_MAP_UPDATE,
            ProcedureId::Terminate => PendingProcedures::TERMINATE,
            ProcedureId::EncryptionStart => PendingProcedures::ENC_START,
            ProcedureId::EncryptionPause => PendingProcedures::ENC_PAUSE,
            ProcedureId::FeatureExchange => PendingProcedures::FEATURE_EXCHANGE,
            ProcedureId::VersionExchange => PendingProcedures::VERSION_EXCHANGE,
            ProcedureId::ConnParamRequest => PendingProcedures::CONN_PARAM_REQ,
            ProcedureId::Ping => PendingProcedures::PING,
            ProcedureId::DataLengthUpdate => PendingProcedures::DATA_LENGTH_UPDATE,
        }
    }

    /// Returns whether `opcode` is the PDU that initiates this procedure.
    ///
    /// Used to match `LL_UNKNOWN_RSP` and `LL_REJECT_IND_EXT` against the procedure they answer.
    pub fn initiated_by(&self, opcode: ControlOpcode) -> bool {
        match self {
            ProcedureId::ConnectionUpdate => opcode == ControlOpcode::ConnectionUpdateReq,
            ProcedureId::ChannelMapUpdate => opcode == ControlOpcode::ChannelMapReq,
            ProcedureId::Terminate => opcode == ControlOpcode::TerminateInd,
            ProcedureId::EncryptionStart => opcode == ControlOpcode::EncReq,
            ProcedureId::EncryptionPause => opcode == ControlOpcode::PauseEncReq,
            ProcedureId::FeatureExchange => {
                opcode == ControlOpcode::FeatureReq || opcode == ControlOpcode::SlaveFeatureReq
            }
            ProcedureId::VersionExchange => opcode == ControlOpcode::VersionInd,
            ProcedureId::ConnParamRequest => opcode == ControlOpcode::ConnectionParamReq,
            ProcedureId::Ping => opcode == ControlOpcode::PingReq,
            ProcedureId::DataLengthUpdate => opcode == ControlOpcode::LengthReq,
        }
    }

    /// Returns whether this procedure changes the connection's timing parameters.
    ///
    /// Two timing-changing procedures running in opposite directions are a *procedure collision*
    /// and must be resolved deterministically by role.
    fn changes_timing(&self) -> bool {
        matches!(
            self,
            ProcedureId::ConnectionUpdate | ProcedureId::ConnParamRequest
        )
    }

    /// Returns whether the response timeout is armed for this procedure.
    ///
    /// The channel map update has no response PDU (it completes at its instant), so no timeout
    /// applies. Termination runs its own shorter timeout based on the supervision timeout.
    fn uses_response_timeout(&self) -> bool {
        !matches!(
            self,
            ProcedureId::ChannelMapUpdate | ProcedureId::Terminate
        )
    }
}

bitflags! {
    /// Set of procedures waiting for the current one to finish.
    pub struct PendingProcedures: u16 {
        const CONN_UPDATE = 1 << 0;
        const CHAN_MAP_UPDATE = 1 << 1;
        const TERMINATE = 1 << 2;
        const ENC_START = 1 << 3;
        const ENC_PAUSE = 1 << 4;
        const FEATURE_EXCHANGE = 1 << 5;
        const VERSION_EXCHANGE = 1 << 6;
        const CONN_PARAM_REQ = 1 << 7;
        const PING = 1 << 8;
        const DATA_LENGTH_UPDATE = 1 << 9;
    }
}

impl PendingProcedures {
    /// Returns the highest-priority procedure in the set.
    ///
    /// Termination always goes first, encryption transitions next, everything else in fixed
    /// declaration order.
    fn first(&self) -> Option<ProcedureId> {
        const ORDER: [ProcedureId; 10] = [
            ProcedureId::Terminate,
            ProcedureId::EncryptionStart,
            ProcedureId::EncryptionPause,
            ProcedureId::ConnectionUpdate,
            ProcedureId::ChannelMapUpdate,
            ProcedureId::FeatureExchange,
            ProcedureId::VersionExchange,
            ProcedureId::ConnParamRequest,
            ProcedureId::Ping,
            ProcedureId::DataLengthUpdate,
        ];

        ORDER.iter().find(|id| self.contains(id.flag())).copied()
    }
}

/// How to react to a procedure request PDU from the peer, given the procedures we are running
/// ourselves.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CollisionOutcome {
    /// No conflict. Process the peer's request normally.
    Process,

    /// Reject the peer's request with `LL_REJECT_IND_EXT` and error `LmpCollision`.
    ///
    /// The master's procedure wins a collision, so a master answering a conflicting slave
    /// request rejects it and keeps its own procedure running.
    Reject,

    /// Abandon our own procedure (reporting `LmpCollision` to the host) and process the peer's
    /// request.
    ///
    /// The slave loses a collision against the master's conflicting procedure.
    YieldOwn,
}

/// The locally initiated procedure currently in flight.
#[derive(Debug, Copy, Clone)]
struct CurrentProcedure {
    id: ProcedureId,
    /// Absolute deadline for the peer's response, if the procedure uses one.
    timeout_at: Option<Instant>,
}

/// Tracks control procedure state for one connection.
#[derive(Debug)]
pub struct ProcedureEngine {
    current: Option<CurrentProcedure>,
    pending: PendingProcedures,

    /// Peer's feature set, once a feature exchange has completed.
    remote_features: Option<FeatureSet>,

    /// Peer's version information, once a version exchange has completed.
    remote_version: Option<(VersionNumber, CompanyId, u16)>,

    /// Whether we already answered (or initiated) a version exchange. A `LL_VERSION_IND` is only
    /// ever sent once per connection.
    version_sent: bool,
}

impl ProcedureEngine {
    pub fn new() -> Self {
        Self {
            current: None,
            pending: PendingProcedures::empty(),
            remote_features: None,
            remote_version: None,
            version_sent: false,
        }
    }

    /// Returns the locally initiated procedure currently in flight.
    pub fn current(&self) -> Option<ProcedureId> {
        self.current.map(|cur| cur.id)
    }

    /// Returns whether any procedure is queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    /// Queues a procedure for execution.
    ///
    /// Requesting a procedure that is already pending or in flight is a no-op.
    pub fn request(&mut self, id: ProcedureId) {
        if self.current() == Some(id) {
            return;
        }
        self.pending.insert(id.flag());
    }

    /// Takes the next queued procedure and makes it current, arming the response timeout.
    ///
    /// Returns `None` when a procedure is already in flight or nothing is queued. The caller is
    /// responsible for building and transmitting the procedure's request PDU.
    pub fn start_next(&mut self, now: Instant) -> Option<ProcedureId> {
        if self.current.is_some() {
            return None;
        }
        let id = self.pending.first()?;
        self.pending.remove(id.flag());
        self.current = Some(CurrentProcedure {
            id,
            timeout_at: if id.uses_response_timeout() {
                Some(now + PROCEDURE_TIMEOUT)
            } else {
                None
            },
        });
        Some(id)
    }

    /// Marks the current procedure as finished.
    ///
    /// Returns the finished procedure so the caller can report completion to the host.
    pub fn complete(&mut self) -> Option<ProcedureId> {
        self.current.take().map(|cur| cur.id)
    }

    /// Re-arms the response timeout of the current procedure.
    ///
    /// Used when a procedure consists of multiple request/response rounds (eg. encryption start):
    /// every response from the peer restarts `T_prt`.
    pub fn refresh_timeout(&mut self, now: Instant) {
        if let Some(cur) = &mut self.current {
            if cur.timeout_at.is_some() {
                cur.timeout_at = Some(now + PROCEDURE_TIMEOUT);
            }
        }
    }

    /// Returns whether the current procedure's response timeout has expired.
    ///
    /// When this returns `true`, the connection must be terminated with `LmpResponseTimeout`.
    pub fn timed_out(&self, now: Instant) -> bool {
        match self.current {
            Some(CurrentProcedure {
                timeout_at: Some(at),
                ..
            }) => at.is_before_or_at(now),
            _ => false,
        }
    }

    /// Resolves a potential procedure collision for an incoming request PDU.
    ///
    /// A collision exists when the peer requests a timing-changing procedure while our own
    /// timing-changing procedure is in flight. The master's procedure wins.
    pub fn check_collision(&self, incoming: ProcedureId, our_role: Role) -> CollisionOutcome {
        let conflicting = match self.current() {
            Some(cur) => {
                cur == incoming || (cur.changes_timing() && incoming.changes_timing())
            }
            None => false,
        };

        if !conflicting {
            CollisionOutcome::Process
        } else {
            match our_role {
                Role::Master => CollisionOutcome::Reject,
                Role::Slave => CollisionOutcome::YieldOwn,
            }
        }
    }

    /// Abandons the current procedure without completing it.
    pub fn abandon(&mut self) -> Option<ProcedureId> {
        self.current.take().map(|cur| cur.id)
    }

    /// Handles a received `LL_UNKNOWN_RSP` for the PDU type `unknown_type`.
    ///
    /// If the response matches the request of the current procedure, the procedure is cancelled
    /// and returned so the caller can report `UnsupportedRemoteFeature` to the host.
    pub fn on_unknown_rsp(&mut self, unknown_type: ControlOpcode) -> Option<ProcedureId> {
        match self.current {
            Some(cur) if cur.id.initiated_by(unknown_type) => self.complete(),
            _ => None,
        }
    }

    /// Handles a received `LL_REJECT_IND` or `LL_REJECT_IND_EXT`.
    ///
    /// `reject_opcode` is the rejected PDU type from `LL_REJECT_IND_EXT`, or `None` for the
    /// legacy `LL_REJECT_IND`, which implicitly rejects the current procedure. Returns the
    /// cancelled procedure and the peer's error code.
    pub fn on_reject(
        &mut self,
        reject_opcode: Option<ControlOpcode>,
        error_code: StatusCode,
    ) -> Option<(ProcedureId, StatusCode)> {
        let matches = match (self.current, reject_opcode) {
            (Some(_), None) => true,
            (Some(cur), Some(opcode)) => cur.id.initiated_by(opcode),
            (None, _) => false,
        };
        if matches {
            self.complete().map(|id| (id, error_code))
        } else {
            None
        }
    }

    /// Records the peer's feature set after a completed feature exchange.
    pub fn set_remote_features(&mut self, features: FeatureSet) {
        self.remote_features = Some(features);
    }

    /// Returns the peer's feature set, if a feature exchange has completed.
    pub fn remote_features(&self) -> Option<FeatureSet> {
        self.remote_features
    }

    /// Returns whether the peer is known to *not* support `feature`.
    ///
    /// While the peer's features are unknown, everything is assumed supported and probing a
    /// procedure is allowed (the peer will answer with `LL_UNKNOWN_RSP` if it must).
    pub fn peer_lacks(&self, feature: FeatureSet) -> bool {
        match self.remote_features {
            Some(features) => !features.contains(feature),
            None => false,
        }
    }

    /// Records the peer's version information.
    pub fn set_remote_version(
        &mut self,
        vers_nr: VersionNumber,
        comp_id: CompanyId,
        sub_vers_nr: u16,
    ) {
        self.remote_version = Some((vers_nr, comp_id, sub_vers_nr));
    }

    /// Returns the peer's version information, if a version exchange has completed.
    pub fn remote_version(&self) -> Option<(VersionNumber, CompanyId, u16)> {
        self.remote_version
    }

    /// Marks our `LL_VERSION_IND` as sent. Returns `false` when it was already sent, in which
    /// case no further version PDU may be transmitted on this connection.
    pub fn mark_version_sent(&mut self) -> bool {
        !core::mem::replace(&mut self.version_sent, true)
    }
}

impl Default for ProcedureEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(micros: u32) -> Instant {
        Instant::from_raw_micros(micros)
    }

    #[test]
    fn one_procedure_at_a_time() {
        let mut eng = ProcedureEngine::new();
        eng.request(ProcedureId::FeatureExchange);
        eng.request(ProcedureId::Ping);

        assert_eq!(eng.start_next(t(0)), Some(ProcedureId::FeatureExchange));
        assert_eq!(eng.start_next(t(0)), None);
        assert_eq!(eng.complete(), Some(ProcedureId::FeatureExchange));
        assert_eq!(eng.start_next(t(0)), Some(ProcedureId::Ping));
        assert_eq!(eng.complete(), Some(ProcedureId::Ping));
        assert!(eng.is_idle());
    }

    #[test]
    fn terminate_preempts_queue_order() {
        let mut eng = ProcedureEngine::new();
        eng.request(ProcedureId::DataLengthUpdate);
        eng.request(ProcedureId::Terminate);
        assert_eq!(eng.start_next(t(0)), Some(ProcedureId::Terminate));
    }

    #[test]
    fn response_timeout_expires_after_40s() {
        let mut eng = ProcedureEngine::new();
        eng.request(ProcedureId::VersionExchange);
        eng.start_next(t(0));

        assert!(!eng.timed_out(t(39_999_999)));
        assert!(eng.timed_out(t(40_000_000)));
    }

    #[test]
    fn channel_map_update_has_no_response_timeout() {
        let mut eng = ProcedureEngine::new();
        eng.request(ProcedureId::ChannelMapUpdate);
        eng.start_next(t(0));
        assert!(!eng.timed_out(t(90_000_000)));
    }

    #[test]
    fn refresh_restarts_timeout() {
        let mut eng = ProcedureEngine::new();
        eng.request(ProcedureId::EncryptionStart);
        eng.start_next(t(0));
        eng.refresh_timeout(t(30_000_000));
        assert!(!eng.timed_out(t(60_000_000)));
        assert!(eng.timed_out(t(70_000_000)));
    }

    #[test]
    fn collision_resolution_is_role_deterministic() {
        // Same setup on both sides: a timing-changing procedure in flight, a timing-changing
        // request coming in. Exactly one side must yield.
        let mut master = ProcedureEngine::new();
        master.request(ProcedureId::ConnectionUpdate);
        master.start_next(t(0));

        let mut slave = ProcedureEngine::new();
        slave.request(ProcedureId::ConnParamRequest);
        slave.start_next(t(0));

        assert_eq!(
            master.check_collision(ProcedureId::ConnParamRequest, Role::Master),
            CollisionOutcome::Reject
        );
        assert_eq!(
            slave.check_collision(ProcedureId::ConnectionUpdate, Role::Slave),
            CollisionOutcome::YieldOwn
        );
    }

    #[test]
    fn unrelated_procedures_do_not_collide() {
        let mut eng = ProcedureEngine::new();
        eng.request(ProcedureId::FeatureExchange);
        eng.start_next(t(0));
        assert_eq!(
            eng.check_collision(ProcedureId::ConnectionUpdate, Role::Slave),
            CollisionOutcome::Process
        );
    }

    #[test]
    fn unknown_rsp_cancels_matching_procedure() {
        let mut eng = ProcedureEngine::new();
        eng.request(ProcedureId::DataLengthUpdate);
        eng.start_next(t(0));

        assert_eq!(eng.on_unknown_rsp(ControlOpcode::PingReq), None);
        assert_eq!(
            eng.on_unknown_rsp(ControlOpcode::LengthReq),
            Some(ProcedureId::DataLengthUpdate)
        );
        assert_eq!(eng.current(), None);
    }

    #[test]
    fn reject_ext_must_name_the_request() {
        let mut eng = ProcedureEngine::new();
        eng.request(ProcedureId::ConnParamRequest);
        eng.start_next(t(0));

        assert_eq!(
            eng.on_reject(Some(ControlOpcode::EncReq), StatusCode::LmpCollision),
            None
        );
        assert_eq!(
            eng.on_reject(
                Some(ControlOpcode::ConnectionParamReq),
                StatusCode::UnacceptableConnectionParameters
            ),
            Some((
                ProcedureId::ConnParamRequest,
                StatusCode::UnacceptableConnectionParameters
            ))
        );
    }

    #[test]
    fn version_is_sent_once() {
        let mut eng = ProcedureEngine::new();
        assert!(eng.mark_version_sent());
        assert!(!eng.mark_version_sent());
    }
}
