/// Point-in-time observation of a single domain engine.
///
/// Snapshots are taken under the engine's dispensing lock, so `current` and
/// `max` always describe one coherent bucket and never a bucket caught
/// mid-promotion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Stats {
    /// Last dispensed ID (zero before the first successful dispense).
    pub current: u64,
    /// Exclusive upper bound of the active segment.
    pub max: u64,
    /// Number of successful segment renewals.
    pub renew_count: u64,
    /// Number of renewals that exhausted their retry budget. Any nonzero
    /// value means the domain ran degraded at some point.
    pub renew_err_count: u64,
}
