//! The static catalog of buildable clients and simulators, discovered by
//! scanning the filesystem for docker build contexts.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::libhive::errors::{HiveError, HiveResult};

/// What separates the client name from its build arguments.
///
/// All arguments start with a letter followed by a colon. The last argument,
/// when no prefix is given, is the branch or tag name. Supported prefixes:
///
///   f: - dockerfile suffix (builds from `Dockerfile.<suffix>`)
///   u: - user name (owner of the git repository)
///   r: - repository name
///   b: - branch or tag name
///
/// Examples:
///
///   besu_nightly                 -> client: besu, branch: nightly
///   besu_u:hyperledger_b:main    -> client: besu, user: hyperledger, branch: main
///   go-ethereum_f:git            -> client: go-ethereum, dockerfile: Dockerfile.git
const ARG_DELIMITER: char = '_';

/// A client reference with optional build arguments, parsed from the
/// argument-delimited form described at [`ARG_DELIMITER`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDesignator {
    pub client: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dockerfile: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repo: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub branch: String,
}

impl ClientDesignator {
    pub fn parse(s: &str) -> Self {
        let mut parts = s.split(ARG_DELIMITER);
        let mut des = ClientDesignator {
            client: parts.next().unwrap_or_default().to_string(),
            ..Default::default()
        };
        let rest: Vec<&str> = parts.collect();
        let last = rest.len().wrapping_sub(1);
        for (i, part) in rest.iter().enumerate() {
            match part.split_once(':') {
                Some(("u", v)) => des.user = v.to_string(),
                Some(("r", v)) => des.repo = v.to_string(),
                Some(("f", v)) => des.dockerfile = v.to_string(),
                Some(("b", v)) => des.branch = v.to_string(),
                _ if i == last => des.branch = part.to_string(),
                // Unprefixed inner tokens belong to the client name itself.
                _ => {
                    des.client.push(ARG_DELIMITER);
                    des.client.push_str(part);
                }
            }
        }
        des
    }

    /// The canonical display name, as shown in results and matched against
    /// `--client` patterns. Parsing it again yields the same designator.
    pub fn name(&self) -> String {
        self.to_string()
    }

    /// Build arguments passed to the image build.
    pub fn build_args(&self) -> Vec<(String, String)> {
        let mut args = Vec::new();
        if !self.branch.is_empty() {
            args.push(("branch".to_string(), self.branch.clone()));
        }
        if !self.user.is_empty() {
            args.push(("user".to_string(), self.user.clone()));
        }
        if !self.repo.is_empty() {
            args.push(("repo".to_string(), self.repo.clone()));
        }
        args
    }

    /// The Dockerfile name to build, honoring the `f:` suffix.
    pub fn dockerfile_name(&self) -> String {
        if self.dockerfile.is_empty() {
            "Dockerfile".to_string()
        } else {
            format!("Dockerfile.{}", self.dockerfile)
        }
    }
}

impl fmt::Display for ClientDesignator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.client)?;
        if !self.dockerfile.is_empty() {
            write!(f, "_f:{}", self.dockerfile)?;
        }
        if !self.user.is_empty() {
            write!(f, "_u:{}", self.user)?;
        }
        if !self.repo.is_empty() {
            write!(f, "_r:{}", self.repo)?;
        }
        if !self.branch.is_empty() {
            write!(f, "_{}", self.branch)?;
        }
        Ok(())
    }
}

/// Parses a comma-separated client list argument.
pub fn parse_client_list(arg: &str) -> Vec<ClientDesignator> {
    arg.split(',').filter(|s| !s.is_empty()).map(ClientDesignator::parse).collect()
}

/// Keeps names of clients and simulators found on disk.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub base_dir: PathBuf,
    pub clients: BTreeSet<String>,
    pub simulators: BTreeSet<String>,
}

impl Inventory {
    /// Finds all clients and simulators under `base_dir`. A definition is a
    /// directory containing a `Dockerfile`; the walk does not descend
    /// further once one is found.
    pub fn load(base_dir: impl Into<PathBuf>) -> HiveResult<Inventory> {
        let base_dir = base_dir.into();
        let clients = find_dockerfiles(&base_dir.join("clients"))?;
        let simulators = find_dockerfiles(&base_dir.join("simulators"))?;
        Ok(Inventory { base_dir, clients, simulators })
    }

    /// True if the inventory contains the given client. The reference may
    /// carry build-argument suffixes.
    pub fn has_client(&self, client: &ClientDesignator) -> bool {
        self.clients.contains(&client.client)
    }

    pub fn has_simulator(&self, name: &str) -> bool {
        self.simulators.contains(name)
    }

    /// The directory containing the given client's Dockerfile.
    pub fn client_directory(&self, client: &ClientDesignator) -> PathBuf {
        self.base_dir.join("clients").join(&client.client)
    }

    /// The directory containing the given simulator's Dockerfile.
    pub fn simulator_directory(&self, name: &str) -> PathBuf {
        self.base_dir.join("simulators").join(name)
    }

    /// Returns simulator names matching the regular expression.
    pub fn match_simulators(&self, expr: &str) -> HiveResult<Vec<String>> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Ok(Vec::new());
        }
        let re = regex::Regex::new(expr)
            .map_err(|err| HiveError::Inventory(format!("bad simulator pattern: {err}")))?;
        Ok(self.simulators.iter().filter(|s| re.is_match(s)).cloned().collect())
    }

    /// Registers a client name directly. For unit testing only.
    #[doc(hidden)]
    pub fn add_client(&mut self, name: &str) {
        self.clients.insert(name.to_string());
    }

    /// Registers a simulator name directly. For unit testing only.
    #[doc(hidden)]
    pub fn add_simulator(&mut self, name: &str) {
        self.simulators.insert(name.to_string());
    }
}

fn find_dockerfiles(dir: &Path) -> HiveResult<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    if !dir.is_dir() {
        return Err(HiveError::Inventory(format!("missing directory {}", dir.display())));
    }
    walk(dir, dir, &mut names)?;
    Ok(names)
}

fn walk(root: &Path, dir: &Path, names: &mut BTreeSet<String>) -> HiveResult<()> {
    if dir.join("Dockerfile").is_file() {
        if let Ok(rel) = dir.strip_prefix(root) {
            let name = rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/");
            if !name.is_empty() {
                names.insert(name);
                return Ok(());
            }
        }
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk(root, &path, names)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn designator_parsing() {
        let cases = [
            ("besu", ClientDesignator { client: "besu".into(), ..Default::default() }),
            (
                "besu_nightly",
                ClientDesignator {
                    client: "besu".into(),
                    branch: "nightly".into(),
                    ..Default::default()
                },
            ),
            (
                "besu_u:hyperledger_b:main",
                ClientDesignator {
                    client: "besu".into(),
                    user: "hyperledger".into(),
                    branch: "main".into(),
                    ..Default::default()
                },
            ),
            (
                "go-ethereum_f:git",
                ClientDesignator {
                    client: "go-ethereum".into(),
                    dockerfile: "git".into(),
                    ..Default::default()
                },
            ),
            (
                "nimbus_el_f:git_u:status-im_r:nimbus-eth1_master",
                ClientDesignator {
                    client: "nimbus_el".into(),
                    dockerfile: "git".into(),
                    user: "status-im".into(),
                    repo: "nimbus-eth1".into(),
                    branch: "master".into(),
                },
            ),
        ];
        for (input, want) in cases {
            assert_eq!(ClientDesignator::parse(input), want, "parsing {input:?}");
        }
    }

    #[test]
    fn designator_roundtrip() {
        for name in
            ["besu", "besu_nightly", "go-ethereum_f:git", "reth_f:git_u:alice_r:reth_main"]
        {
            let parsed = ClientDesignator::parse(name);
            assert_eq!(ClientDesignator::parse(&parsed.name()), parsed, "through {name:?}");
        }
    }

    #[test]
    fn suffixed_name_resolves_to_same_client() {
        let mut inv = Inventory::default();
        inv.add_client("go-ethereum");
        assert!(inv.has_client(&ClientDesignator::parse("go-ethereum")));
        assert!(inv.has_client(&ClientDesignator::parse("go-ethereum_f:git_b:master")));
        assert!(!inv.has_client(&ClientDesignator::parse("geth")));
    }

    #[test]
    fn dockerfile_scan_stops_at_first_match() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        for sub in ["clients/geth", "clients/nested/inner", "simulators/devp2p/discv4"] {
            std::fs::create_dir_all(base.join(sub)).unwrap();
        }
        std::fs::write(base.join("clients/geth/Dockerfile"), "FROM scratch").unwrap();
        std::fs::write(base.join("clients/nested/Dockerfile"), "FROM scratch").unwrap();
        // Not reached: parent already has a Dockerfile.
        std::fs::write(base.join("clients/nested/inner/Dockerfile"), "FROM scratch").unwrap();
        std::fs::write(base.join("simulators/devp2p/discv4/Dockerfile"), "FROM scratch")
            .unwrap();

        let inv = Inventory::load(base).unwrap();
        assert_eq!(
            inv.clients.iter().cloned().collect::<Vec<_>>(),
            vec!["geth".to_string(), "nested".to_string()]
        );
        assert!(inv.has_simulator("devp2p/discv4"));
        assert_eq!(inv.match_simulators("devp2p").unwrap().len(), 1);
        assert!(inv.match_simulators("").unwrap().is_empty());
    }

    #[test]
    fn client_list_parsing() {
        let list = parse_client_list("geth,besu_nightly");
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].client, "besu");
        assert_eq!(list[1].branch, "nightly");
    }
}
