//! Collector selection: upgrades requested classes to what the remote
//! actually supports, removes overlapping collectors, and elects one
//! collector per object. All pure functions of (request, capability
//! record) with deterministic output order.

use oxpoll_common::error::Error;
use oxpoll_common::remote::Remote;
use std::collections::{HashMap, HashSet};
use std::future::Future;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ObjectCollector {
    pub class: String,
    pub object: String,
}

impl ObjectCollector {
    pub fn new(class: impl Into<String>, object: impl Into<String>) -> Self {
        ObjectCollector {
            class: class.into(),
            object: object.into(),
        }
    }
}

pub fn is_ontap_class(class: &str) -> bool {
    matches!(class, "Zapi" | "ZapiPerf" | "Rest" | "RestPerf" | "KeyPerf")
}

/// Collectors that would collect the same object twice: the legacy and
/// REST inventory collectors shadow each other, as do the performance
/// collectors. Inventory never shadows performance and vice versa.
fn overlap_group(class: &str) -> Option<usize> {
    match class {
        "Zapi" | "Rest" => Some(0),
        "ZapiPerf" | "RestPerf" | "KeyPerf" => Some(1),
        _ => None,
    }
}

/// Maps a requested collector class onto the one the remote supports.
/// Non-ONTAP classes and an empty capability record pass through
/// unchanged.
pub fn upgrade_collector(class: &str, remote: &Remote) -> String {
    if remote.is_zero() || !is_ontap_class(class) {
        return class.to_string();
    }

    let mut class = class;
    if !remote.zapis_exist {
        class = match class {
            "Zapi" => "Rest",
            "ZapiPerf" => "RestPerf",
            other => other,
        };
    }
    if remote.is_disaggregated {
        class = match class {
            "ZapiPerf" | "RestPerf" => "KeyPerf",
            other => other,
        };
        if remote.is_san_optimized && class == "Zapi" {
            class = "Rest";
        }
    }
    class.to_string()
}

/// Keeps the first collector of each overlap group, in user-declared
/// order, and drops exact duplicates. Idempotent.
pub fn non_overlapping_collectors(collectors: Vec<ObjectCollector>) -> Vec<ObjectCollector> {
    let mut chosen: [Option<String>; 2] = [None, None];
    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut result = Vec::with_capacity(collectors.len());

    for oc in collectors {
        if let Some(group) = overlap_group(&oc.class) {
            match &chosen[group] {
                Some(class) if *class != oc.class => continue,
                _ => chosen[group] = Some(oc.class.clone()),
            }
        }
        if seen.insert((oc.class.clone(), oc.object.clone())) {
            result.push(oc);
        }
    }
    result
}

/// The legacy Qtree collector emits quota series through its plugin, so
/// a separate Quota collector would duplicate them.
const SHADOWED_OBJECTS: &[(&str, &str, &str)] = &[("Zapi", "Qtree", "Quota")];

/// Elects one collector per object (the first in the user-declared
/// list) and drops objects whose series another object's chosen
/// collector already covers. Output is ordered by object name.
pub fn uniquify_object_collectors(
    objects_to_collectors: HashMap<String, Vec<ObjectCollector>>,
) -> Vec<ObjectCollector> {
    let mut objects: Vec<&String> = objects_to_collectors.keys().collect();
    objects.sort();

    let mut chosen: Vec<ObjectCollector> = objects
        .into_iter()
        .filter_map(|object| objects_to_collectors[object].first().cloned())
        .collect();

    for (class, object, covered) in SHADOWED_OBJECTS {
        let shadowing = chosen
            .iter()
            .any(|oc| oc.class == *class && oc.object == *object);
        if shadowing {
            chosen.retain(|oc| oc.object != *covered);
        }
    }
    chosen
}

/// A poller with prefer_zapi keeps using the legacy transport while the
/// remote still answers it: REST requests map back to their ZAPI
/// counterparts before the upgrade rules run.
pub fn apply_zapi_preference(class: &str, remote: &Remote, prefer_zapi: bool) -> String {
    if !prefer_zapi || !remote.zapis_exist {
        return class.to_string();
    }
    match class {
        "Rest" => "Zapi".to_string(),
        "RestPerf" => "ZapiPerf".to_string(),
        other => other.to_string(),
    }
}

/// Probes the remote only when an ONTAP-class collector is requested.
/// The probe may fail and still return a partial record; the poller
/// continues with whatever it got.
pub async fn negotiate_remote<F, Fut>(classes: &[String], probe: F) -> Remote
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = (Remote, Option<Error>)>,
{
    if !classes.iter().any(|c| is_ontap_class(c)) {
        return Remote::default();
    }
    let (remote, err) = probe().await;
    if let Some(e) = err {
        tracing::warn!(error = %e, "Capability probe failed, continuing with last answer");
    }
    remote
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxpoll_common::remote::Version;

    fn remote(version: &str, zapis: bool, disaggregated: bool, san: bool) -> Remote {
        Remote {
            version: version.parse::<Version>().unwrap(),
            zapis_exist: zapis,
            is_disaggregated: disaggregated,
            is_san_optimized: san,
            ..Remote::default()
        }
    }

    fn ocs(names: &[&str]) -> Vec<ObjectCollector> {
        names.iter().map(|n| ObjectCollector::new(*n, "")).collect()
    }

    #[test]
    fn upgrade_table() {
        let ontap911 = remote("9.11.1", true, false, false);
        let ontap917 = remote("9.17.1", false, false, false);
        let disaggregated = remote("9.17.1", false, true, false);
        let disaggregated_with_zapi = remote("9.17.1", true, true, false);
        let asa_r2 = remote("9.16.1", false, true, true);

        let cases = [
            (&ontap911, "Zapi", "Zapi"),
            (&ontap911, "ZapiPerf", "ZapiPerf"),
            (&ontap911, "Rest", "Rest"),
            (&ontap911, "KeyPerf", "KeyPerf"),
            (&ontap917, "Zapi", "Rest"),
            (&ontap917, "ZapiPerf", "RestPerf"),
            (&ontap917, "KeyPerf", "KeyPerf"),
            (&disaggregated, "Zapi", "Rest"),
            (&disaggregated, "Rest", "Rest"),
            (&disaggregated, "ZapiPerf", "KeyPerf"),
            (&disaggregated, "RestPerf", "KeyPerf"),
            (&disaggregated_with_zapi, "Zapi", "Zapi"),
            (&disaggregated_with_zapi, "ZapiPerf", "KeyPerf"),
            (&disaggregated_with_zapi, "RestPerf", "KeyPerf"),
            (&asa_r2, "Zapi", "Rest"),
            (&asa_r2, "RestPerf", "KeyPerf"),
        ];
        for (remote, asked, want) in cases {
            assert_eq!(
                upgrade_collector(asked, remote),
                want,
                "asked {asked} against {remote:?}"
            );
        }
    }

    #[test]
    fn upgrade_passes_non_ontap_and_empty_record_through() {
        assert_eq!(
            upgrade_collector("StorageGrid", &remote("11.7.0", false, false, false)),
            "StorageGrid"
        );
        assert_eq!(upgrade_collector("Zapi", &Remote::default()), "Zapi");
    }

    #[test]
    fn non_overlap_table() {
        let cases: &[(&[&str], &[&str])] = &[
            (&[], &[]),
            (&["Rest"], &["Rest"]),
            (&["Rest", "ZapiPerf"], &["Rest", "ZapiPerf"]),
            (&["Rest", "Zapi"], &["Rest"]),
            (&["Zapi", "Rest"], &["Zapi"]),
            (
                &[
                    "Zapi", "Rest", "Rest", "Rest", "Rest", "Rest", "Zapi", "Zapi", "Zapi",
                    "Zapi", "Zapi",
                ],
                &["Zapi"],
            ),
            (&["Rest", "SG"], &["Rest", "SG"]),
            (&["Rest", "KeyPerf"], &["Rest", "KeyPerf"]),
            (&["RestPerf", "KeyPerf"], &["RestPerf"]),
            (&["KeyPerf", "KeyPerf"], &["KeyPerf"]),
        ];
        for (input, want) in cases {
            assert_eq!(
                non_overlapping_collectors(ocs(input)),
                ocs(want),
                "input {input:?}"
            );
        }
    }

    #[test]
    fn non_overlap_is_idempotent() {
        let once = non_overlapping_collectors(ocs(&["Zapi", "Rest", "RestPerf", "KeyPerf", "SG"]));
        let twice = non_overlapping_collectors(once.clone());
        assert_eq!(once, twice);
    }

    fn object_map(entries: &[(&str, &[&str])]) -> HashMap<String, Vec<ObjectCollector>> {
        entries
            .iter()
            .map(|(object, classes)| {
                (
                    object.to_string(),
                    classes
                        .iter()
                        .map(|class| ObjectCollector::new(*class, *object))
                        .collect(),
                )
            })
            .collect()
    }

    #[test]
    fn uniquify_elects_first_choice_per_object() {
        let cases: &[(&[(&str, &[&str])], &[(&str, &str)])] = &[
            (&[], &[]),
            (&[("Volume", &["Rest", "Zapi"])], &[("Rest", "Volume")]),
            (&[("Qtree", &["Rest", "Zapi"])], &[("Rest", "Qtree")]),
            (&[("Qtree", &["Zapi", "Rest"])], &[("Zapi", "Qtree")]),
            (
                &[("Qtree", &["Rest", "Zapi"]), ("Quota", &["Rest"])],
                &[("Rest", "Qtree"), ("Rest", "Quota")],
            ),
            (
                &[("Qtree", &["Zapi", "Rest"]), ("Quota", &["Rest"])],
                &[("Zapi", "Qtree")],
            ),
            (
                &[("Volume", &["RestPerf", "KeyPerf"])],
                &[("RestPerf", "Volume")],
            ),
            (
                &[("Volume", &["KeyPerf", "RestPerf"])],
                &[("KeyPerf", "Volume")],
            ),
            (
                &[("Volume", &["RestPerf"]), ("Aggregate", &["KeyPerf"])],
                &[("KeyPerf", "Aggregate"), ("RestPerf", "Volume")],
            ),
        ];
        for (input, want) in cases {
            let mut got = uniquify_object_collectors(object_map(input));
            got.sort();
            let mut want: Vec<ObjectCollector> = want
                .iter()
                .map(|(class, object)| ObjectCollector::new(*class, *object))
                .collect();
            want.sort();
            assert_eq!(got, want, "input {input:?}");
        }
    }

    #[test]
    fn uniquify_output_order_is_deterministic() {
        let map = object_map(&[
            ("Volume", &["Rest"]),
            ("Aggregate", &["Rest"]),
            ("Qtree", &["Rest"]),
        ]);
        let first = uniquify_object_collectors(map.clone());
        let second = uniquify_object_collectors(map);
        assert_eq!(first, second);
        let objects: Vec<&str> = first.iter().map(|oc| oc.object.as_str()).collect();
        assert_eq!(objects, ["Aggregate", "Qtree", "Volume"]);
    }

    #[test]
    fn zapi_preference_applies_only_while_zapis_answer() {
        let with_zapi = remote("9.11.1", true, false, false);
        let without = remote("9.17.1", false, false, false);

        assert_eq!(apply_zapi_preference("Rest", &with_zapi, true), "Zapi");
        assert_eq!(apply_zapi_preference("RestPerf", &with_zapi, true), "ZapiPerf");
        assert_eq!(apply_zapi_preference("Rest", &with_zapi, false), "Rest");
        assert_eq!(apply_zapi_preference("Rest", &without, true), "Rest");
        assert_eq!(apply_zapi_preference("KeyPerf", &with_zapi, true), "KeyPerf");
    }

    #[tokio::test]
    async fn negotiate_skips_probe_without_ontap_collectors() {
        let remote = negotiate_remote(&["StorageGrid".to_string()], || async {
            panic!("probe must not run")
        })
        .await;
        assert!(remote.is_zero());
    }

    #[tokio::test]
    async fn negotiate_keeps_partial_record_on_probe_error() {
        let probed = remote("9.11.1", true, false, false);
        let expected = probed.clone();
        let got = negotiate_remote(&["Zapi".to_string()], || async move {
            (
                probed,
                Some(Error::Transient("failed to gather cluster info".to_string())),
            )
        })
        .await;
        assert_eq!(got, expected);
    }
}
