//! Expansion, selection and ordering of tests.

use std::sync::Arc;

use super::TestCase;
use crate::marks::{TopologyMark, TopologyRequirement};
use crate::options::MultihostOptions;
use crate::topology::Topology;

/// One runnable instance of a test, bound to at most one topology.
#[derive(Debug, Clone)]
pub struct TestItem {
    /// Item name; `"{test} ({topology})"` for expanded tests
    pub name: String,
    /// Registered test
    pub case: Arc<TestCase>,
    /// Topology the item runs with
    pub mark: Option<TopologyMark>,
}

impl TestItem {
    /// Name of the item topology, empty for items without one.
    pub fn topology_name(&self) -> &str {
        self.mark.as_ref().map(TopologyMark::name).unwrap_or("")
    }
}

/// Creates the items of a test: one per mark of a list or group, a single
/// item otherwise.
pub fn expand(case: Arc<TestCase>) -> Vec<TestItem> {
    match case.requirement() {
        None => vec![TestItem {
            name: case.name().to_string(),
            mark: None,
            case: Arc::clone(&case),
        }],
        Some(TopologyRequirement::Mark(mark)) => vec![TestItem {
            name: case.name().to_string(),
            mark: Some(mark.clone()),
            case: Arc::clone(&case),
        }],
        Some(requirement) => requirement
            .marks()
            .into_iter()
            .map(|mark| TestItem {
                name: format!("{} ({})", case.name(), mark.name()),
                mark: Some(mark.clone()),
                case: Arc::clone(&case),
            })
            .collect(),
    }
}

/// Decides whether `item` runs against an inventory providing `topology`.
pub fn can_run(item: &TestItem, topology: &Topology, options: &MultihostOptions) -> bool {
    let Some(ref mark) = item.mark else {
        return !item.case.uses_multihost() && options.topology.is_empty();
    };

    let matches = if options.exact_topology {
        mark.topology() == topology
    } else {
        topology.satisfies(mark.topology())
    };
    if !matches {
        return false;
    }

    if options.not_topology.iter().any(|name| name == mark.name()) {
        return false;
    }

    if !options.topology.is_empty() && !options.topology.iter().any(|name| name == mark.name()) {
        return false;
    }

    if options.topology.is_empty() && !options.ignore_preferred_topology {
        if let Some(preferred) = item.case.preferred() {
            return preferred == mark.name();
        }
    }

    true
}

/// Selected and deselected items.
#[derive(Debug, Default)]
pub struct Selection {
    /// Items to run, in declaration order
    pub selected: Vec<TestItem>,
    /// Items that will not run
    pub deselected: Vec<TestItem>,
}

/// Splits items by [`can_run`].
pub fn select(items: Vec<TestItem>, topology: &Topology, options: &MultihostOptions) -> Selection {
    let (selected, deselected) = items
        .into_iter()
        .partition(|item| can_run(item, topology, options));
    Selection { selected, deselected }
}

/// Groups items by topology name, groups sorted by name, items without a
/// topology first. Order inside a group is kept.
pub fn order(mut items: Vec<TestItem>) -> Vec<TestItem> {
    items.sort_by(|a, b| a.topology_name().cmp(b.topology_name()));
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marks::KnownTopologyGroup;
    use crate::topology::TopologyDomain;

    fn mark(name: &str, roles: &[(&str, usize)]) -> TopologyMark {
        TopologyMark::new(
            name,
            Topology::new([TopologyDomain::new("test", roles.iter().copied())]).unwrap(),
        )
    }

    fn case(name: &str) -> TestCase {
        TestCase::new(name, |_| async { Ok(()) })
    }

    fn inventory() -> Topology {
        Topology::new([TopologyDomain::new("test", [("client", 1), ("ldap", 1)])]).unwrap()
    }

    fn names(items: &[TestItem]) -> Vec<&str> {
        items.iter().map(|i| i.name.as_str()).collect()
    }

    #[test]
    fn test_expand() {
        let client = mark("client", &[("client", 1)]);
        let ldap = mark("ldap", &[("client", 1), ("ldap", 1)]);

        let items = expand(Arc::new(case("test_single").topology(client.clone())));
        assert_eq!(names(&items), vec!["test_single"]);

        let group = KnownTopologyGroup::new("any", vec![client.clone(), ldap.clone()]);
        let items = expand(Arc::new(case("test_group").param("user", "tuser").topology(group)));
        assert_eq!(names(&items), vec!["test_group (client)", "test_group (ldap)"]);
        assert!(items.iter().all(|i| i.case.params().get("user").is_ok()));

        let items = expand(Arc::new(case("test_list").topology(vec![ldap])));
        assert_eq!(names(&items), vec!["test_list (ldap)"]);
    }

    #[test]
    fn test_can_run_satisfies() {
        let options = MultihostOptions::default();
        let small = expand(Arc::new(case("a").topology(mark("client", &[("client", 1)]))));
        let big = expand(Arc::new(case("b").topology(mark("ldaps", &[("client", 1), ("ldap", 2)]))));
        assert!(can_run(&small[0], &inventory(), &options));
        assert!(!can_run(&big[0], &inventory(), &options));

        let exact = MultihostOptions {
            exact_topology: true,
            ..Default::default()
        };
        assert!(!can_run(&small[0], &inventory(), &exact));
        let same = expand(Arc::new(case("c").topology(mark("ldap", &[("ldap", 1), ("client", 1)]))));
        assert!(can_run(&same[0], &inventory(), &exact));
    }

    #[test]
    fn test_can_run_without_mark() {
        let options = MultihostOptions::default();
        let plain = expand(Arc::new(case("plain").without_multihost()));
        let needs_mh = expand(Arc::new(case("needs_mh")));
        assert!(can_run(&plain[0], &inventory(), &options));
        assert!(!can_run(&needs_mh[0], &inventory(), &options));

        let filtered = MultihostOptions {
            topology: vec!["client".to_string()],
            ..Default::default()
        };
        assert!(!can_run(&plain[0], &inventory(), &filtered));
    }

    #[test]
    fn test_topology_filters() {
        let group = KnownTopologyGroup::new(
            "any",
            vec![mark("client", &[("client", 1)]), mark("ldap", &[("ldap", 1)])],
        );
        let items = expand(Arc::new(case("t").topology(group)));

        let not_client = MultihostOptions {
            not_topology: vec!["client".to_string()],
            ..Default::default()
        };
        let selection = select(items.clone(), &inventory(), &not_client);
        assert_eq!(names(&selection.selected), vec!["t (ldap)"]);
        assert_eq!(names(&selection.deselected), vec!["t (client)"]);

        let only_client = MultihostOptions {
            topology: vec!["client".to_string()],
            ..Default::default()
        };
        let selection = select(items, &inventory(), &only_client);
        assert_eq!(names(&selection.selected), vec!["t (client)"]);
    }

    #[test]
    fn test_preferred_topology() {
        let group = KnownTopologyGroup::new(
            "any",
            vec![mark("client", &[("client", 1)]), mark("ldap", &[("ldap", 1)])],
        );
        let items = expand(Arc::new(case("t").topology(group).preferred_topology("ldap")));

        let selection = select(items.clone(), &inventory(), &MultihostOptions::default());
        assert_eq!(names(&selection.selected), vec!["t (ldap)"]);

        let ignore = MultihostOptions {
            ignore_preferred_topology: true,
            ..Default::default()
        };
        assert_eq!(select(items.clone(), &inventory(), &ignore).selected.len(), 2);

        let filtered = MultihostOptions {
            topology: vec!["client".to_string()],
            ..Default::default()
        };
        assert_eq!(names(&select(items, &inventory(), &filtered).selected), vec!["t (client)"]);
    }

    #[test]
    fn test_order() {
        let client = mark("client", &[("client", 1)]);
        let ldap = mark("ldap", &[("ldap", 1)]);
        let mut items = Vec::new();
        items.extend(expand(Arc::new(case("t1").topology(ldap.clone()))));
        items.extend(expand(Arc::new(case("t2").topology(client.clone()))));
        items.extend(expand(Arc::new(case("t3").without_multihost())));
        items.extend(expand(Arc::new(case("t4").topology(ldap))));
        items.extend(expand(Arc::new(case("t5").topology(client))));

        assert_eq!(names(&order(items)), vec!["t3", "t2", "t5", "t1", "t4"]);
    }
}
