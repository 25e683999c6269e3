//! Pure rule parsing, matching, evaluation and generation.
//!
//! Nothing in this crate performs I/O; every function is a plain
//! computation over strings and the shared protocol types, which makes it
//! trivially unit-testable in isolation from the queue, config, and
//! mediation subsystems that consume it.

use mediator_protocol::Category;
use mediator_protocol::ParsedRule;
use mediator_protocol::RuleSet;
use regex_lite::Regex;
use wildmatch::WildMatch;

/// Result of evaluating a target against a ruleset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Parse a rule string of the form `category(pattern)` or bare `category`
/// (which is sugar for `category(*)`). Returns `None` for an unknown
/// category or an empty pattern.
pub fn parse(rule: &str) -> Option<ParsedRule> {
    let rule = rule.trim();
    if rule.is_empty() {
        return None;
    }

    if let Some(open) = rule.find('(') {
        if !rule.ends_with(')') {
            return None;
        }
        let category_str = &rule[..open];
        let pattern = &rule[open + 1..rule.len() - 1];
        if pattern.is_empty() {
            return None;
        }
        let category = Category::parse(category_str)?;
        Some(ParsedRule::new(category, pattern))
    } else {
        let category = Category::parse(rule)?;
        Some(ParsedRule::new(category, "*"))
    }
}

/// Match `pattern` against `target`, dispatching on category. `filesystem`
/// uses a path-aware glob (`*` = one segment, `**` = zero-or-more
/// segments); every other category uses a shell-style glob where `*`
/// matches any run of characters, including `/` and spaces.
pub fn matches(pattern: &str, target: &str, category: Category) -> bool {
    if category == Category::Filesystem {
        path_glob_matches(pattern, target)
    } else {
        WildMatch::new(pattern).matches(target)
    }
}

fn path_glob_matches(pattern: &str, target: &str) -> bool {
    let pattern_segs: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let target_segs: Vec<&str> = target.split('/').filter(|s| !s.is_empty()).collect();
    segs_match(&pattern_segs, &target_segs)
}

fn segs_match(pattern: &[&str], target: &[&str]) -> bool {
    match pattern.first() {
        None => target.is_empty(),
        Some(&"**") => {
            // `**` matches zero or more segments: try consuming 0..=N
            // segments of target before matching the rest of the pattern.
            for consumed in 0..=target.len() {
                if segs_match(&pattern[1..], &target[consumed..]) {
                    return true;
                }
            }
            false
        }
        Some(&seg) => match target.first() {
            None => false,
            Some(&t) => {
                let one_segment_matches = seg == "*" || WildMatch::new(seg).matches(t);
                one_segment_matches && segs_match(&pattern[1..], &target[1..])
            }
        },
    }
}

/// Evaluate a target against a ruleset for a given category. Deny rules are
/// examined first, in insertion order; first match wins. If no deny
/// matches, allow rules are examined in insertion order, but a blanket
/// allow (`*` pattern) for a hardened category (`exec`, `packages`) is
/// silently skipped — blanket auto-allow of arbitrary commands/package
/// installs is never permitted. Returns `None` if nothing matched.
pub fn evaluate(ruleset: &RuleSet, category: Category, target: &str) -> Option<Decision> {
    for rule in &ruleset.deny {
        if let Some(parsed) = parse(rule) {
            if parsed.category == category && matches(&parsed.pattern, target, category) {
                return Some(Decision::Deny);
            }
        }
    }

    for rule in &ruleset.allow {
        let Some(parsed) = parse(rule) else {
            continue;
        };
        if parsed.category != category {
            continue;
        }
        if category.is_hardened() && parsed.pattern == "*" {
            continue;
        }
        if matches(&parsed.pattern, target, category) {
            return Some(Decision::Allow);
        }
    }

    None
}

/// Extract the host (without port) from a network action such as
/// `"CONNECT example.com:443"` or `"GET https://example.com/path"`.
pub fn extract_network_host(action: &str) -> Option<String> {
    let mut parts = action.splitn(2, ' ');
    let verb = parts.next()?;
    let target = parts.next()?.trim();

    if verb.eq_ignore_ascii_case("CONNECT") {
        let host = target.split(':').next()?;
        return Some(host.to_string());
    }

    // METHOD scheme://host[:port]/path...
    let without_scheme = target.split_once("://").map(|(_, rest)| rest)?;
    let host_port = without_scheme.split('/').next()?;
    let host = host_port.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

fn is_ipv4_literal(host: &str) -> bool {
    static IPV4_RE: &str = r"^(\d{1,3})\.(\d{1,3})\.(\d{1,3})\.(\d{1,3})$";
    Regex::new(IPV4_RE)
        .ok()
        .is_some_and(|re| re.is_match(host))
}

/// Generate a plausible "always allow" rule string for the given category
/// and action. The result is
/// re-parsed before it is ever inserted (see `mediator-config`), so a
/// heuristic that produces something unparseable simply fails to add a
/// rule rather than corrupting the ruleset.
pub fn generate(category: Category, action: &str) -> String {
    match category {
        Category::Network => {
            let host = extract_network_host(action).unwrap_or_else(|| action.to_string());
            if is_ipv4_literal(&host) {
                format!("network({host})")
            } else {
                let labels: Vec<&str> = host.split('.').collect();
                if labels.len() >= 2 {
                    let last_two = &labels[labels.len() - 2..];
                    format!("network(*.{})", last_two.join("."))
                } else {
                    format!("network({host})")
                }
            }
        }
        Category::Filesystem => {
            let rest = action.strip_prefix("sync ").unwrap_or(action);
            match rest.rsplit_once('/') {
                Some((dir, _file)) if !dir.is_empty() => format!("filesystem({dir}/*)"),
                _ => format!("filesystem({rest})"),
            }
        }
        Category::Git => {
            let branch = action.strip_prefix("push ").unwrap_or(action);
            format!("git({branch})")
        }
        Category::Exec | Category::Packages | Category::Sandbox => {
            format!("{category}({action})")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediator_protocol::RuleSet;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_bare_category_is_wildcard() {
        let parsed = parse("network").unwrap();
        assert_eq!(parsed.category, Category::Network);
        assert_eq!(parsed.pattern, "*");
    }

    #[test]
    fn parse_rejects_unknown_category() {
        assert!(parse("bogus(foo)").is_none());
        assert!(parse("bogus").is_none());
    }

    #[test]
    fn parse_rejects_empty_pattern() {
        assert!(parse("network()").is_none());
    }

    #[test]
    fn filesystem_double_star_matches_any_depth() {
        assert!(matches("src/**/*.rs", "src/a/b/c.rs", Category::Filesystem));
        assert!(matches("src/**/*.rs", "src/c.rs", Category::Filesystem));
        assert!(!matches("src/**/*.rs", "lib/a/c.rs", Category::Filesystem));
    }

    #[test]
    fn filesystem_single_star_matches_one_segment() {
        assert!(matches("src/*/mod.rs", "src/a/mod.rs", Category::Filesystem));
        assert!(!matches(
            "src/*/mod.rs",
            "src/a/b/mod.rs",
            Category::Filesystem
        ));
    }

    #[test]
    fn shell_glob_matches_across_slashes() {
        assert!(matches(
            "CONNECT *.example.com*",
            "CONNECT evil.example.com:443",
            Category::Network
        ));
    }

    /// A deny rule always beats a matching allow rule.
    #[test]
    fn deny_beats_allow() {
        let rules = RuleSet {
            allow: vec!["network(*.example.com)".to_string()],
            deny: vec!["network(evil.example.com)".to_string()],
        };
        assert_eq!(
            evaluate(&rules, Category::Network, "evil.example.com"),
            Some(Decision::Deny)
        );
    }

    #[test]
    fn first_match_wins_within_each_bucket() {
        let rules = RuleSet {
            allow: vec![
                "network(*.example.com)".to_string(),
                "network(foo.example.com)".to_string(),
            ],
            deny: vec![],
        };
        // Both match; the first inserted allow rule should be the one that
        // produces the decision (evaluate just needs *a* match, but ordering
        // matters once multiple rulesets interact via generate()+insert()).
        assert_eq!(
            evaluate(&rules, Category::Network, "foo.example.com"),
            Some(Decision::Allow)
        );
    }

    #[test]
    fn blanket_allow_is_ignored_for_hardened_categories() {
        let rules = RuleSet {
            allow: vec!["exec(*)".to_string(), "packages(*)".to_string()],
            deny: vec![],
        };
        assert_eq!(evaluate(&rules, Category::Exec, "rm -rf /"), None);
        assert_eq!(evaluate(&rules, Category::Packages, "npm install left-pad"), None);
    }

    #[test]
    fn scoped_exec_allow_rule_still_works() {
        let rules = RuleSet {
            allow: vec!["exec(git status)".to_string()],
            deny: vec![],
        };
        assert_eq!(
            evaluate(&rules, Category::Exec, "git status"),
            Some(Decision::Allow)
        );
    }

    #[test]
    fn extract_host_from_connect() {
        assert_eq!(
            extract_network_host("CONNECT example.com:443"),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn extract_host_from_method_url() {
        assert_eq!(
            extract_network_host("GET https://example.com/foo/bar"),
            Some("example.com".to_string())
        );
    }

    #[test]
    fn generate_network_rule_for_hostname() {
        assert_eq!(
            generate(Category::Network, "CONNECT evil.example.com:443"),
            "network(*.example.com)"
        );
    }

    #[test]
    fn generate_network_rule_for_ipv4() {
        assert_eq!(
            generate(Category::Network, "CONNECT 10.0.0.5:443"),
            "network(10.0.0.5)"
        );
    }

    #[test]
    fn generate_filesystem_rule_strips_directory() {
        assert_eq!(
            generate(Category::Filesystem, "sync src/foo.ts"),
            "filesystem(src/*)"
        );
        assert_eq!(
            generate(Category::Filesystem, "sync foo.ts"),
            "filesystem(foo.ts)"
        );
    }

    #[test]
    fn generate_git_rule_strips_push_prefix() {
        assert_eq!(generate(Category::Git, "push main"), "git(main)");
    }

    #[test]
    fn generate_exec_rule_is_verbatim() {
        assert_eq!(
            generate(Category::Exec, "rm -rf /tmp/x"),
            "exec(rm -rf /tmp/x)"
        );
    }

    #[test]
    fn generated_rules_always_reparse() {
        for (category, action) in [
            (Category::Network, "CONNECT example.com:443"),
            (Category::Filesystem, "sync src/foo.ts"),
            (Category::Git, "push main"),
            (Category::Exec, "git status"),
            (Category::Packages, "npm install express"),
            (Category::Sandbox, "set categories.network.mode allow-all"),
        ] {
            let rule = generate(category, action);
            assert!(parse(&rule).is_some(), "generated rule `{rule}` must reparse");
        }
    }
}
