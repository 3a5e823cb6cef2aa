//! Property-based tests: the replica clamp, flag normalization, worker
//! assignment and diff-classification invariants hold over generated
//! inputs, not just the hand-picked cases.

use proptest::prelude::*;

use postgresql_operator::cluster::users::normalize_user_flags;
use postgresql_operator::resources::statefulset::effective_number_of_instances;
use postgresql_operator::util::{NamespacedName, cluster_worker_id};

/// Bounds are either disabled (-1) or small non-negative values.
fn bound() -> impl Strategy<Value = i32> {
    prop_oneof![Just(-1), 0..=100i32]
}

proptest! {
    /// The computed replica count equals mathematical clamping with -1
    /// treated as an absent bound. The min bound wins over the max bound,
    /// matching the order the operator applies them in.
    #[test]
    fn replica_clamp_matches_the_reference(cur in -10..200i32, min in bound(), max in bound()) {
        let got = effective_number_of_instances(cur, min, max);

        let mut expected = cur;
        if max >= 0 && expected > max {
            expected = max;
        }
        if min >= 0 && expected < min {
            expected = min;
        }
        prop_assert_eq!(got, expected);

        // the result honors the bounds themselves
        if min >= 0 {
            prop_assert!(got >= min);
        }
        if max >= 0 && min <= max {
            prop_assert!(got <= max);
        }
    }

    /// Worker assignment is pure and in range for any identity.
    #[test]
    fn worker_assignment_is_pure(
        ns in "[a-z][a-z0-9-]{0,20}",
        name in "[a-z][a-z0-9-]{0,30}",
        workers in 1..32u32,
    ) {
        let cluster = NamespacedName::new(&ns, &name);
        let id = cluster_worker_id(&cluster, workers);
        prop_assert!(id < workers);
        prop_assert_eq!(cluster_worker_id(&cluster, workers), id);
    }

    /// Normalization never panics, and a successful result is upper-case,
    /// sorted, and mentions LOGIN unless NOLOGIN was requested.
    #[test]
    fn flag_normalization_is_well_formed(flags in prop::collection::vec("[a-zA-Z0-9!]{1,12}", 0..6)) {
        let input: Vec<String> = flags;
        if let Ok(normalized) = normalize_user_flags(&input) {
            let mut sorted = normalized.clone();
            sorted.sort();
            prop_assert_eq!(&normalized, &sorted);
            prop_assert!(normalized.iter().all(|f| f.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())));
            prop_assert!(!normalized.contains(&"NOLOGIN".to_string()));
            let requested_nologin = input.iter().any(|f| f.eq_ignore_ascii_case("nologin"));
            if !requested_nologin && !input.iter().any(|f| f.eq_ignore_ascii_case("login")) {
                prop_assert!(normalized.contains(&"LOGIN".to_string()));
            }
        }
    }

    /// Normalization is idempotent over the materializable vocabulary:
    /// feeding a normalized set back in returns it unchanged. (`nologin`
    /// is excluded: it is deliberately dropped from the output, the way
    /// the catalog query never reports it either.)
    #[test]
    fn flag_normalization_is_idempotent(
        flags in prop::collection::vec(
            prop_oneof![
                Just("superuser"), Just("login"), Just("createdb"), Just("createrole"),
                Just("inherit"), Just("noinherit"), Just("replication"), Just("bypassrls"),
            ].prop_map(str::to_string),
            0..6,
        )
    ) {
        if let Ok(once) = normalize_user_flags(&flags) {
            let twice = normalize_user_flags(&once).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}

mod diff_props {
    use std::collections::BTreeMap;

    use proptest::prelude::*;

    use postgresql_operator::cluster::diff::compare_services;
    use postgresql_operator::config::Config;
    use postgresql_operator::resources::common::{ClusterInfo, PostgresRole};
    use postgresql_operator::resources::service::generate_service;

    fn manifest_with(
        lb: bool,
        ranges: Option<Vec<String>>,
        annotations: Vec<(String, String)>,
    ) -> postgresql_operator::crd::Postgresql {
        let mut pg: postgresql_operator::crd::Postgresql =
            serde_json::from_value(serde_json::json!({
                "apiVersion": "acid.zalan.do/v1",
                "kind": "postgresql",
                "metadata": {"name": "acid-prop", "namespace": "default"},
                "spec": {"teamId": "acid", "volume": {"size": "1Gi"}}
            }))
            .unwrap();
        pg.spec.enable_master_load_balancer = Some(lb);
        pg.spec.allowed_source_ranges = ranges;
        pg.spec.service_annotations = annotations.into_iter().collect::<BTreeMap<_, _>>();
        pg
    }

    fn ranges() -> impl Strategy<Value = Option<Vec<String>>> {
        prop_oneof![
            Just(None),
            Just(Some(vec![])),
            Just(Some(vec!["10.0.0.0/8".to_string()])),
            Just(Some(vec!["192.168.0.0/16".to_string(), "10.0.0.0/8".to_string()])),
        ]
    }

    fn annotations() -> impl Strategy<Value = Vec<(String, String)>> {
        prop::collection::vec(
            ("[a-z]{1,8}", "[a-z0-9]{1,8}").prop_map(|(k, v)| (k, v)),
            0..3,
        )
    }

    proptest! {
        /// Service classification is total (never panics) and symmetric in
        /// its action flags.
        #[test]
        fn service_classification_is_symmetric(
            lb_a in any::<bool>(), lb_b in any::<bool>(),
            ranges_a in ranges(), ranges_b in ranges(),
            ann_a in annotations(), ann_b in annotations(),
        ) {
            let config = Config::default();
            let ma = manifest_with(lb_a, ranges_a, ann_a);
            let mb = manifest_with(lb_b, ranges_b, ann_b);
            let a = generate_service(&ClusterInfo::new(&ma, &config), PostgresRole::Master);
            let b = generate_service(&ClusterInfo::new(&mb, &config), PostgresRole::Master);

            let ab = compare_services(&a, &b);
            let ba = compare_services(&b, &a);
            prop_assert_eq!(ab.needs_patch, ba.needs_patch);
            prop_assert_eq!(ab.is_equal(), ba.is_equal());

            // reflexivity: every rendering equals itself
            prop_assert!(compare_services(&a, &a).is_equal());
        }
    }
}
