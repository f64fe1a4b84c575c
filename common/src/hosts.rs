//! Host list input: inline lists, host files and numeric ranges
//!
//! All sources are merged into a single list without duplicates, in the order hosts were first
//! seen.

use anyhow::{anyhow, Context};

use crate::registry::Target;

/// Split a whitespace separated list of hosts.
pub fn parse_host_list(list: &str) -> Vec<String> {
    list.split_whitespace().map(str::to_string).collect()
}

/// One host per line, ignoring blank lines and `#` comments.
pub fn parse_host_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| match line.split_once('#') {
            Some((host, _comment)) => host,
            None => line,
        })
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub async fn read_host_file(path: &std::path::Path) -> anyhow::Result<Vec<String>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed reading host file {:?}", path))?;
    let hosts = parse_host_lines(&text);
    tracing::debug!("read {} host(s) from {:?}", hosts.len(), path);
    Ok(hosts)
}

fn parse_bound(bound: &str, spec: &str) -> anyhow::Result<u64> {
    if bound.is_empty() || !bound.chars().all(|c| c.is_ascii_digit()) {
        return Err(anyhow!("invalid number {:?} in host range {:?}", bound, spec));
    }
    bound
        .parse()
        .with_context(|| format!("number {bound:?} in host range {spec:?} is too large"))
}

/// Expand `base[a-b,c,...]suffix` into host names.
///
/// Numbers are zero padded to the width of the range start, so `node[01-03]` yields `node01`,
/// `node02` and `node03`.
pub fn expand_range(spec: &str) -> anyhow::Result<Vec<String>> {
    let spec = spec.trim();
    let (base, rest) = spec
        .split_once('[')
        .ok_or_else(|| anyhow!("host range {:?} is missing '['", spec))?;
    let (ranges, suffix) = rest
        .split_once(']')
        .ok_or_else(|| anyhow!("host range {:?} is missing ']'", spec))?;
    if base.is_empty() && suffix.is_empty() {
        return Err(anyhow!("host range {:?} has no host name", spec));
    }
    if suffix.contains(['[', ']']) {
        return Err(anyhow!("host range {:?} has more than one range", spec));
    }
    let mut hosts = vec![];
    for range in ranges.split(',').map(str::trim) {
        let (start, end) = match range.split_once('-') {
            Some((start, end)) => (start.trim(), end.trim()),
            None => (range, range),
        };
        let width = start.len();
        let first = parse_bound(start, spec)?;
        let last = parse_bound(end, spec)?;
        if first > last {
            return Err(anyhow!(
                "range {:?} in {:?} is descending",
                range,
                spec
            ));
        }
        hosts.extend((first..=last).map(|n| format!("{base}{n:0width$}{suffix}")));
    }
    Ok(hosts)
}

/// Ordered set of host names.
#[derive(Debug, Default, Clone)]
pub struct HostSet {
    seen: std::collections::HashSet<String>,
    hosts: Vec<String>,
}

impl HostSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the host was already present.
    pub fn insert(&mut self, host: String) -> bool {
        if self.seen.contains(&host) {
            return false;
        }
        self.seen.insert(host.clone());
        self.hosts.push(host);
        true
    }

    pub fn extend(&mut self, hosts: impl IntoIterator<Item = String>) {
        for host in hosts {
            self.insert(host);
        }
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }
}

/// Prefix `host` with `user@` unless it already names a user.
pub fn qualify(host: &str, user: Option<&str>) -> String {
    match user {
        Some(user) if !host.contains('@') => format!("{user}@{host}"),
        _ => host.to_string(),
    }
}

/// One target per host, all receiving the file at `dest`.
pub fn build_targets(hosts: &HostSet, user: Option<&str>, dest: &str) -> Vec<Target> {
    hosts
        .hosts()
        .iter()
        .map(|host| Target::new(qualify(host, user), dest))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_list() {
        assert_eq!(
            parse_host_list("  a b\tc\n d "),
            vec!["a", "b", "c", "d"]
        );
        assert!(parse_host_list("   ").is_empty());
    }

    #[test]
    fn host_file_lines() {
        let text = "node1\n\n  node2  \n# rack 3\nnode3 # flaky\n\t\n";
        assert_eq!(parse_host_lines(text), vec!["node1", "node2", "node3"]);
    }

    #[tokio::test]
    async fn host_file_from_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hosts");
        tokio::fs::write(&path, "a\nb\n\nc\n").await?;
        assert_eq!(read_host_file(&path).await?, vec!["a", "b", "c"]);
        assert!(read_host_file(&dir.path().join("missing")).await.is_err());
        Ok(())
    }

    #[test]
    fn range_with_padding() -> anyhow::Result<()> {
        assert_eq!(
            expand_range("node[01-03]")?,
            vec!["node01", "node02", "node03"]
        );
        assert_eq!(
            expand_range("node[8-10]")?,
            vec!["node8", "node9", "node10"]
        );
        Ok(())
    }

    #[test]
    fn range_with_several_parts_and_suffix() -> anyhow::Result<()> {
        assert_eq!(
            expand_range("rack[1-2,5, 007].dc1")?,
            vec!["rack1.dc1", "rack2.dc1", "rack5.dc1", "rack007.dc1"]
        );
        Ok(())
    }

    #[test]
    fn malformed_ranges() {
        for spec in [
            "node",
            "node[1-3",
            "node[]",
            "node[a-b]",
            "node[3-1]",
            "node[1-]",
            "[1-3]",
            "node[1-2]x[3-4]",
        ] {
            assert!(expand_range(spec).is_err(), "{spec:?} should not expand");
        }
    }

    #[test]
    fn host_set_keeps_first_seen_order() {
        let mut set = HostSet::new();
        set.extend(parse_host_list("b a b c a"));
        assert!(!set.insert("c".to_string()));
        assert!(set.insert("d".to_string()));
        assert_eq!(set.hosts(), ["b", "a", "c", "d"]);
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn targets_are_user_qualified() {
        let mut set = HostSet::new();
        set.extend(["node1".to_string(), "root@node2".to_string()]);
        let targets = build_targets(&set, Some("deploy"), "/tmp/f");
        assert_eq!(
            targets,
            vec![
                Target::new("deploy@node1", "/tmp/f"),
                Target::new("root@node2", "/tmp/f"),
            ]
        );
        let targets = build_targets(&set, None, "/tmp/f");
        assert_eq!(targets[0].host, "node1");
    }

    proptest::proptest! {
        #[test]
        fn range_expands_to_every_number(start in 0u64..500, len in 0u64..200, pad in 0usize..3) {
            let first = format!("{:0width$}", start, width = pad + start.to_string().len());
            let spec = format!("h[{}-{}]", first, start + len);
            let hosts = expand_range(&spec)
                .map_err(|error| proptest::test_runner::TestCaseError::fail(format!("{error:#}")))?;
            proptest::prop_assert_eq!(hosts.len() as u64, len + 1);
            for (host, n) in hosts.iter().zip(start..) {
                let digits = &host[1..];
                proptest::prop_assert!(digits.len() >= first.len());
                proptest::prop_assert_eq!(digits.parse::<u64>()?, n);
            }
        }
    }
}
