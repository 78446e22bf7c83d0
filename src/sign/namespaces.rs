//! Namespace validation.
//!
//! Proposals carry *required* namespaces (chains + methods + events); an
//! approval carries *settled* namespaces (accounts + methods + events).
//! Settlement is only valid when every required capability is granted:
//! every required chain has at least one account, and the method/event
//! lists are supersets of what was required.

use crate::error::{Error, Result};
use crate::sign::types::{ProposedNamespaces, SettledNamespaces};

/// Validate the shape of proposed namespaces before sending a proposal
pub fn validate_proposed(namespaces: &ProposedNamespaces) -> Result<()> {
    for (name, namespace) in namespaces {
        if namespace.chains.is_empty() {
            return Err(Error::NonConformingNamespaces(format!(
                "Namespace {name} has no chains"
            )));
        }
        for chain in &namespace.chains {
            if !chain.starts_with(&format!("{name}:")) {
                return Err(Error::NonConformingNamespaces(format!(
                    "Chain {chain} does not belong to namespace {name}"
                )));
            }
        }
    }
    Ok(())
}

/// Check that settled namespaces satisfy the required namespaces
pub fn conforms(required: &ProposedNamespaces, settled: &SettledNamespaces) -> Result<()> {
    for (name, req) in required {
        let granted = settled.get(name).ok_or_else(|| {
            Error::NonConformingNamespaces(format!("Missing namespace: {name}"))
        })?;

        for account in &granted.accounts {
            // CAIP-10: namespace:reference:address
            if account.splitn(3, ':').count() != 3 {
                return Err(Error::NonConformingNamespaces(format!(
                    "Malformed account: {account}"
                )));
            }
        }
        for chain in &req.chains {
            let has_account = granted
                .accounts
                .iter()
                .any(|account| account.starts_with(&format!("{chain}:")));
            if !has_account {
                return Err(Error::NonConformingNamespaces(format!(
                    "No account granted for chain {chain}"
                )));
            }
        }
        for method in &req.methods {
            if !granted.methods.contains(method) {
                return Err(Error::NonConformingNamespaces(format!(
                    "Method {method} not granted in namespace {name}"
                )));
            }
        }
        for event in &req.events {
            if !granted.events.contains(event) {
                return Err(Error::NonConformingNamespaces(format!(
                    "Event {event} not granted in namespace {name}"
                )));
            }
        }
    }
    Ok(())
}

/// Whether a settled session grants calling `method` on `chain_id`
pub fn allows_method(settled: &SettledNamespaces, chain_id: &str, method: &str) -> bool {
    settled.values().any(|namespace| {
        namespace.methods.iter().any(|m| m == method)
            && namespace
                .accounts
                .iter()
                .any(|account| account.starts_with(&format!("{chain_id}:")))
    })
}

/// Whether a settled session grants emitting `event` on `chain_id`
pub fn allows_event(settled: &SettledNamespaces, chain_id: &str, event: &str) -> bool {
    settled.values().any(|namespace| {
        namespace.events.iter().any(|e| e == event)
            && namespace
                .accounts
                .iter()
                .any(|account| account.starts_with(&format!("{chain_id}:")))
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::sign::types::{ProposedNamespace, SettledNamespace};

    fn required() -> ProposedNamespaces {
        BTreeMap::from([(
            "eip155".to_string(),
            ProposedNamespace {
                chains: vec!["eip155:1".into(), "eip155:137".into()],
                methods: vec!["personal_sign".into(), "eth_sendTransaction".into()],
                events: vec!["accountsChanged".into()],
            },
        )])
    }

    fn granted() -> SettledNamespaces {
        BTreeMap::from([(
            "eip155".to_string(),
            SettledNamespace {
                accounts: vec!["eip155:1:0xab".into(), "eip155:137:0xab".into()],
                methods: vec![
                    "personal_sign".into(),
                    "eth_sendTransaction".into(),
                    "eth_signTypedData".into(),
                ],
                events: vec!["accountsChanged".into(), "chainChanged".into()],
            },
        )])
    }

    #[test]
    fn test_superset_grant_conforms() {
        assert!(conforms(&required(), &granted()).is_ok());
    }

    #[test]
    fn test_missing_capability_rejected() {
        let mut no_namespace = granted();
        no_namespace.clear();
        assert!(conforms(&required(), &no_namespace).is_err());

        let mut no_account = granted();
        no_account.get_mut("eip155").unwrap().accounts = vec!["eip155:1:0xab".into()];
        assert!(conforms(&required(), &no_account).is_err(), "no account for eip155:137");

        let mut no_method = granted();
        no_method.get_mut("eip155").unwrap().methods = vec!["personal_sign".into()];
        assert!(conforms(&required(), &no_method).is_err());

        let mut no_event = granted();
        no_event.get_mut("eip155").unwrap().events = vec![];
        assert!(conforms(&required(), &no_event).is_err());
    }

    #[test]
    fn test_malformed_account_rejected() {
        let mut bad = granted();
        bad.get_mut("eip155").unwrap().accounts.push("not-caip-10".into());
        assert!(conforms(&required(), &bad).is_err());
    }

    #[test]
    fn test_validate_proposed_shape() {
        assert!(validate_proposed(&required()).is_ok());

        let empty_chains = BTreeMap::from([(
            "eip155".to_string(),
            ProposedNamespace { chains: vec![], methods: vec![], events: vec![] },
        )]);
        assert!(validate_proposed(&empty_chains).is_err());

        let wrong_prefix = BTreeMap::from([(
            "eip155".to_string(),
            ProposedNamespace {
                chains: vec!["cosmos:cosmoshub-4".into()],
                methods: vec![],
                events: vec![],
            },
        )]);
        assert!(validate_proposed(&wrong_prefix).is_err());
    }

    #[test]
    fn test_method_and_event_routing() {
        let grants = granted();
        assert!(allows_method(&grants, "eip155:1", "personal_sign"));
        assert!(!allows_method(&grants, "eip155:10", "personal_sign"), "chain not granted");
        assert!(!allows_method(&grants, "eip155:1", "eth_signTransaction"), "method not granted");
        assert!(allows_event(&grants, "eip155:1", "chainChanged"));
        assert!(!allows_event(&grants, "eip155:1", "bogusEvent"));
    }
}
