//! Protocol and policy constants for signet block production.

/// Four-byte tag that prefixes the signet commitment push in the coinbase.
///
/// # Examples
///
/// ```
/// use signet_core::constants::SIGNET_HEADER;
/// assert_eq!(SIGNET_HEADER, [0xec, 0xc7, 0xda, 0xa2]);
/// ```
pub const SIGNET_HEADER: [u8; 4] = [0xec, 0xc7, 0xda, 0xa2];

/// Identifier of the proprietary envelope field carrying the candidate block.
/// With [`SIGNET_PSBT_SUBTYPE`] and an empty key it serializes as
/// `fc 06 "signet" "b"`.
pub const SIGNET_PSBT_PREFIX: &[u8] = b"signet";

/// Subtype of the proprietary block field.
pub const SIGNET_PSBT_SUBTYPE: u8 = b'b';

/// Prefix of a witness commitment output script:
/// `OP_RETURN`, push 36, then the four commitment header bytes.
pub const WITNESS_COMMITMENT_PREFIX: [u8; 6] = [0x6a, 0x24, 0xaa, 0x21, 0xa9, 0xed];

/// Witness reserved value used for the coinbase witness and commitment.
pub const WITNESS_RESERVED_VALUE: [u8; 32] = [0u8; 32];

/// Sequence number on the coinbase input (enables lock time semantics).
pub const COINBASE_SEQUENCE: u32 = 0xffff_fffe;

/// Nominal block spacing of the network, in seconds.
pub const DEFAULT_TARGET_SPACING: f64 = 1200.0;

/// Correction for the retarget off-by-one: 2016 blocks measured over 2015 intervals.
pub const RETARGET_CORRECTION: f64 = 2016.0 / 2015.0;

/// Bounds on the per-period retarget factor.
pub const MIN_RETARGET_FACTOR: f64 = 0.25;
pub const MAX_RETARGET_FACTOR: f64 = 4.0;

/// Genesis catch-up: the first block is backdated by this many intervals.
pub const GENESIS_BACKDATE_INTERVALS: f64 = 100.0;

/// Actions are never scheduled earlier than `mine_time` minus this many
/// seconds. Nodes reject blocks more than 2h ahead; 1h55m keeps a margin.
pub const MAX_FUTURE_BLOCK_SAFETY: i64 = 6900;

/// Default cap on a single simulated block interval, in seconds.
pub const DEFAULT_MAX_INTERVAL: f64 = 1800.0;

/// Ultimate target selected by `--min-nbits`.
pub const MIN_NBITS: u32 = 0x1e03_77ae;

/// Difficulty used when measuring solver throughput.
pub const CALIBRATION_TRIAL_BITS: u32 = 0x1e3e_a75f;

/// Number of solves averaged during calibration.
pub const CALIBRATION_TRIALS: u32 = 600;

/// Average solve time targeted by calibration when none is given.
pub const DEFAULT_CALIBRATION_SECONDS: f64 = 25.0;

/// Default JSON-RPC port of a signet full node.
pub const DEFAULT_RPC_PORT: u16 = 38332;
