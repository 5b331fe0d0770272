// tests/prefix_properties.rs
use prefix_gateway::routing::{Route, UpstreamRegistry};
use proptest::prelude::*;
use url::Url;

fn segments() -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec(prop::sample::select(vec!["a", "b", "ab", "api", "v1"]), 0..4)
        .prop_map(|segs| segs.into_iter().map(String::from).collect())
}

fn to_path(segs: &[String]) -> String {
    if segs.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segs.join("/"))
    }
}

/// Brute force: every matching route, longest prefix, last registration on ties.
fn expected(prefixes: &[String], path_segs: &[String]) -> Option<usize> {
    let path = to_path(path_segs);
    prefixes
        .iter()
        .enumerate()
        .filter(|(_, prefix)| {
            prefix.as_str() == "/"
                || path == **prefix
                || path.starts_with(&format!("{}/", prefix))
        })
        .fold(None, |best: Option<(usize, usize)>, (i, prefix)| match best {
            Some((_, len)) if prefix.len() < len => best,
            _ => Some((i, prefix.len())),
        })
        .map(|(i, _)| i)
}

proptest! {
    #[test]
    fn resolve_picks_longest_then_latest(
        route_segs in prop::collection::vec(segments(), 1..8),
        path_segs in segments(),
    ) {
        let prefixes: Vec<String> = route_segs.iter().map(|s| to_path(s)).collect();
        let registry = UpstreamRegistry::new(
            prefixes
                .iter()
                .enumerate()
                .map(|(i, p)| Route::new(p, Url::parse(&format!("http://u{}", i)).unwrap()))
                .collect(),
        );

        let path = to_path(&path_segs);
        let got = registry.resolve(&path).map(|r| r.index);
        prop_assert_eq!(got, expected(&prefixes, &path_segs));
    }

    #[test]
    fn stripped_path_never_keeps_the_prefix_twice(
        prefix_segs in segments().prop_filter("non-root", |s| !s.is_empty()),
        rest in segments(),
    ) {
        let prefix = to_path(&prefix_segs);
        let route = Route::new(&prefix, Url::parse("http://u1").unwrap());
        let path = if rest.is_empty() {
            prefix.clone()
        } else {
            format!("{}{}", prefix, to_path(&rest))
        };

        prop_assert!(route.matches(&path));
        prop_assert_eq!(route.rewrite_path(&path), to_path(&rest));
    }
}
