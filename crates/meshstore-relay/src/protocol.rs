//! JSON command vocabulary for the relay client protocol and the
//! communication-initiation handshake (spec §4.9, §6 "Wire protocol — relay").

/// `register{publicKey}` — a listener asks the relay to hold spare
/// connections for its public key.
pub const REGISTER: &str = "register";
/// `authentication_request{publicKey, challenge}` — relay to registrant,
/// challenge sealed to the registrant's box key.
pub const AUTHENTICATION_REQUEST: &str = "authentication_request";
/// `authentication_response{response}` — registrant to relay.
pub const AUTHENTICATION_RESPONSE: &str = "authentication_response";
/// `authentication_success{pingInterval}` — relay to registrant.
pub const AUTHENTICATION_SUCCESS: &str = "authentication_success";
/// `connection_handover` — relay tells a parked spare it now belongs to a caller.
pub const CONNECTION_HANDOVER: &str = "connection_handover";
/// `communication_request{sourcePublicKey, targetPublicKey}` — caller to relay/listener.
pub const COMMUNICATION_REQUEST: &str = "communication_request";
/// `communication_ready` — receiver to initiator, end of the initiation handshake.
pub const COMMUNICATION_READY: &str = "communication_ready";
/// `synchronisation` — chum sync round marker, exchanged once both sides are ready.
pub const SYNCHRONISATION: &str = "synchronisation";

/// `challenge{payload}` / `challenge_response{payload}` — the person-and-key
/// mutual challenge (distinct command names from the relay's own
/// authentication exchange, carried over the already-encrypted stream).
pub const CHALLENGE: &str = "challenge";
pub const CHALLENGE_RESPONSE: &str = "challenge_response";

/// `identity{personId, keys}` — each side's PersonId id-object and default Keys.
pub const IDENTITY: &str = "identity";

/// Chum sync framing (spec §4.9 "Sync protocol (chum)").
pub const CHUM_WANT: &str = "chum_want";
pub const CHUM_BLOB: &str = "chum_blob";
pub const CHUM_SENT_DONE: &str = "chum_sent_done";
pub const CHUM_DONE: &str = "chum_done";
