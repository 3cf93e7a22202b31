//! Client-side port allocation.

use std::collections::{BTreeMap, HashSet};
use std::net::TcpListener;

use wd_config::{alloc_port, PortExhaustedError};
use wd_workspace::PortBinding;

/// A port is free on the caller's machine if it can be bound right now.
pub fn client_port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Fill the client side of every binding. A label that had a client port
/// in the prior run asks for the same number first; new labels start from
/// their substrate host port. Ports claimed earlier in the same pass stay
/// claimed.
pub fn negotiate_client_ports(
    bindings: &mut [PortBinding],
    prior_client: &BTreeMap<String, u16>,
) -> Result<(), PortExhaustedError> {
    let mut claimed: HashSet<u16> = HashSet::new();
    for binding in bindings.iter_mut() {
        let desired = prior_client
            .get(&binding.label)
            .copied()
            .filter(|p| *p != 0)
            .unwrap_or(binding.current_host_port);
        let probe = |port: u16| !claimed.contains(&port) && client_port_is_free(port);
        let port = alloc_port(&probe, desired)?;
        claimed.insert(port);
        binding.client_port = port;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(label: &str, host: u16) -> PortBinding {
        PortBinding {
            service: "web".into(),
            container_port: host,
            current_host_port: host,
            client_port: 0,
            label: label.into(),
        }
    }

    #[test]
    fn fresh_labels_start_from_host_port() {
        let mut bindings = vec![binding("web", 39131)];
        negotiate_client_ports(&mut bindings, &BTreeMap::new()).unwrap();
        assert_eq!(bindings[0].client_port, 39131);
    }

    #[test]
    fn prior_client_port_is_preferred() {
        let mut bindings = vec![binding("web", 39132)];
        let mut prior = BTreeMap::new();
        prior.insert("web".to_string(), 39140u16);
        negotiate_client_ports(&mut bindings, &prior).unwrap();
        assert_eq!(bindings[0].client_port, 39140);
    }

    #[test]
    fn occupied_client_port_advances() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();
        let mut bindings = vec![binding("web", taken)];
        negotiate_client_ports(&mut bindings, &BTreeMap::new()).unwrap();
        assert_eq!(bindings[0].client_port, taken + 1);
    }

    #[test]
    fn two_labels_never_share_a_client_port() {
        let mut bindings = vec![binding("a", 39150), binding("b", 39150)];
        negotiate_client_ports(&mut bindings, &BTreeMap::new()).unwrap();
        assert_ne!(bindings[0].client_port, bindings[1].client_port);
    }
}
