use meshact_common::config::{TransportConfig, TransportKind};
use meshact_common::protocol::error::{MeshError, Result};
use meshact_common::{Pattern, PinFilter};

/// Identity of a destination: transport kind, address and destination tag.
///
/// Memtest destinations have no address, only a tag.
pub type DestinationKey = (TransportKind, String, String);

/// A registered destination with its parsed pin.
#[derive(Debug, Clone)]
pub struct Destination {
    pub config: TransportConfig,
    pin: Option<PinFilter>,
    seq: u64,
}

impl Destination {
    /// Parses the pin of `config`.
    ///
    /// # Errors
    ///
    /// [`MeshError::Config`] when the pin does not parse.
    pub fn new(config: TransportConfig) -> Result<Self> {
        let pin = config.pin_filter()?;
        Ok(Destination { config, pin, seq: 0 })
    }

    pub fn key(&self) -> DestinationKey {
        let address = match self.config.kind {
            TransportKind::Memtest => String::new(),
            _ => self.config.address(),
        };
        (self.config.kind, address, self.config.dest_tag().to_string())
    }

    pub fn pin(&self) -> Option<&PinFilter> {
        self.pin.as_ref()
    }

    pub fn is_catchall(&self) -> bool {
        self.pin.is_none()
    }
}

/// Chooses one destination per outbound call.
///
/// A destination whose pin matches the call always wins over the catchall,
/// whatever order they were registered in. Among matching pins the one
/// with the most keys wins, then the most recently registered.
#[derive(Debug, Default)]
pub struct PinRouter {
    destinations: Vec<Destination>,
    next_seq: u64,
}

impl PinRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a destination. Returns false when one with the same key is
    /// already registered; the existing entry and its pin are kept.
    pub fn add(&mut self, mut destination: Destination) -> bool {
        if self.contains(&destination.key()) {
            return false;
        }
        self.next_seq += 1;
        destination.seq = self.next_seq;
        self.destinations.push(destination);
        true
    }

    /// Remove a destination
    pub fn remove(&mut self, key: &DestinationKey) -> Option<Destination> {
        let index = self.destinations.iter().position(|d| &d.key() == key)?;
        Some(self.destinations.remove(index))
    }

    pub fn contains(&self, key: &DestinationKey) -> bool {
        self.destinations.iter().any(|d| &d.key() == key)
    }

    /// The destination for `pattern`, if any.
    pub fn route(&self, pattern: &Pattern) -> Option<&Destination> {
        let specific = self
            .destinations
            .iter()
            .filter_map(|d| d.pin.as_ref().map(|pin| (d, pin)))
            .filter(|(_, pin)| pin.matches(pattern))
            .max_by_key(|(d, pin)| (pin.specificity(), d.seq))
            .map(|(d, _)| d);

        specific.or_else(|| {
            self.destinations
                .iter()
                .filter(|d| d.is_catchall())
                .max_by_key(|d| d.seq)
        })
    }

    /// Like [`PinRouter::route`], failing with a routing error that names
    /// the call.
    pub fn select(&self, pattern: &Pattern, tx: &str) -> Result<&Destination> {
        self.route(pattern).ok_or_else(|| MeshError::Routing {
            pattern: pattern.to_string(),
            tx: tx.to_string(),
        })
    }

    /// Get the number of destinations
    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    /// Registered destinations in registration order
    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }
}
