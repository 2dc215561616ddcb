//! The discovery state of one logical service.
use relay_core::DiscoveryError;

/// Latest known state of a service: either the addresses backing it or the
/// failure that prevented discovery. Addresses are kept sorted and
/// deduplicated so equal sets compare equal regardless of input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Snapshot {
    /// addresses, sorted and deduplicated
    Instances(Vec<String>),
    /// discovery failed
    Failure(DiscoveryError),
}

impl Default for Snapshot {
    fn default() -> Self {
        Snapshot::Instances(Vec::new())
    }
}

impl Snapshot {
    /// snapshot for a list of addresses, in any order
    pub fn instances<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut snapshot = Snapshot::Instances(addrs.into_iter().map(Into::into).collect());
        snapshot.normalize();
        snapshot
    }

    /// snapshot for a failure
    pub fn failure(err: DiscoveryError) -> Self {
        Snapshot::Failure(err)
    }

    /// sort and dedup the address list
    pub(crate) fn normalize(&mut self) {
        if let Snapshot::Instances(addrs) = self {
            addrs.sort_unstable();
            addrs.dedup();
        }
    }

    /// the addresses, if this is not a failure
    pub fn addresses(&self) -> Option<&[String]> {
        match self {
            Snapshot::Instances(addrs) => Some(addrs),
            Snapshot::Failure(_) => None,
        }
    }

    /// the failure, if any
    pub fn error(&self) -> Option<&DiscoveryError> {
        match self {
            Snapshot::Failure(err) => Some(err),
            Snapshot::Instances(_) => None,
        }
    }

    /// true if this snapshot carries a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, Snapshot::Failure(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_independent() {
        let a = Snapshot::instances(["10.0.0.2:9", "10.0.0.1:9"]);
        let b = Snapshot::instances(["10.0.0.1:9", "10.0.0.2:9", "10.0.0.1:9"]);
        assert_eq!(a, b);
        assert_eq!(
            a.addresses().unwrap(),
            &["10.0.0.1:9".to_owned(), "10.0.0.2:9".to_owned()]
        );
    }

    #[test]
    fn test_failure() {
        let snap = Snapshot::failure(DiscoveryError::Transport("refused".into()));
        assert!(snap.is_failure());
        assert!(snap.addresses().is_none());
        assert_eq!(
            snap.error(),
            Some(&DiscoveryError::Transport("refused".into()))
        );
        assert!(!Snapshot::default().is_failure());
    }
}
