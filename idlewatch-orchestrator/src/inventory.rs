use anyhow::{Context, Result};
use idlewatch_common::ImpairedSet;
use idlewatch_providers::inventory::FleetInstance;
use idlewatch_providers::FleetProvider;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct InventoryConfig {
    pub ready_tag_key: String,
    pub ready_tag_value: String,
    pub type_tag_key: String,
    /// Matched from the start of the Name tag (not anchored at the end).
    pub name_pattern: Regex,
    /// Instances per type (per region) never considered for stopping.
    pub min_running_per_type: usize,
    /// Fixed shuffle seed; `None` uses entropy.
    pub shuffle_seed: Option<u64>,
}

impl InventoryConfig {
    pub fn new(name_pattern: &str) -> Result<Self> {
        Ok(Self {
            ready_tag_key: "moz-state".to_string(),
            ready_tag_value: "ready".to_string(),
            type_tag_key: "moz-type".to_string(),
            name_pattern: compile_name_pattern(name_pattern)?,
            min_running_per_type: 0,
            shuffle_seed: None,
        })
    }
}

pub fn compile_name_pattern(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("^(?:{})", pattern))
        .with_context(|| format!("invalid worker name pattern {:?}", pattern))
}

/// Immutable inventory for one pass.
#[derive(Debug, Clone)]
pub struct PassSnapshot {
    pub regions: Vec<String>,
    pub candidates: Vec<FleetInstance>,
    pub impaired: ImpairedSet,
}

/// Drop the first `floor` instances of each type, keeping inventory order for
/// the rest. Positional: the kept instances are whichever the provider listed
/// first, not the busiest ones.
pub fn apply_retention_floor(
    instances: Vec<FleetInstance>,
    type_tag_key: &str,
    floor: usize,
) -> Vec<FleetInstance> {
    if floor == 0 {
        return instances;
    }
    let mut seen_by_type: HashMap<Option<String>, usize> = HashMap::new();
    instances
        .into_iter()
        .filter(|i| {
            let key = i.instance_type(type_tag_key).map(|t| t.to_string());
            let seen = seen_by_type.entry(key).or_insert(0);
            *seen += 1;
            if *seen <= floor {
                debug!(
                    "{} - keep running (min {} instances of type {})",
                    i.name,
                    floor,
                    i.instance_type(type_tag_key).unwrap_or("untyped")
                );
                false
            } else {
                true
            }
        })
        .collect()
}

pub fn shuffle_candidates(candidates: &mut [FleetInstance], seed: Option<u64>) {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    candidates.shuffle(&mut rng);
}

pub struct InstanceInventory {
    provider: Arc<dyn FleetProvider>,
    config: InventoryConfig,
}

impl InstanceInventory {
    pub fn new(provider: Arc<dyn FleetProvider>, config: InventoryConfig) -> Self {
        Self { provider, config }
    }

    /// Query every region (all known regions when `regions` is empty) for
    /// candidates and impaired ids, then apply the retention floor per region
    /// and shuffle the flattened list.
    pub async fn snapshot(&self, regions: &[String]) -> Result<PassSnapshot> {
        let regions = if regions.is_empty() {
            debug!("loading all regions");
            self.provider
                .list_regions()
                .await
                .context("list provider regions")?
        } else {
            regions.to_vec()
        };

        let mut candidates = Vec::new();
        let mut impaired = ImpairedSet::default();

        for region in &regions {
            debug!("looking at region {}", region);
            let listed = self
                .provider
                .list_ready_instances(
                    region,
                    &self.config.ready_tag_key,
                    &self.config.ready_tag_value,
                )
                .await
                .with_context(|| format!("list ready instances in {}", region))?;
            let workers: Vec<FleetInstance> = listed
                .into_iter()
                .filter(|i| self.config.name_pattern.is_match(&i.name))
                .collect();

            impaired.extend(
                self.provider
                    .list_impaired_instance_ids(region)
                    .await
                    .with_context(|| format!("list impaired instances in {}", region))?,
            );

            candidates.extend(apply_retention_floor(
                workers,
                &self.config.type_tag_key,
                self.config.min_running_per_type,
            ));
        }

        shuffle_candidates(&mut candidates, self.config.shuffle_seed);

        Ok(PassSnapshot {
            regions,
            candidates,
            impaired,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn worker(name: &str, ty: Option<&str>) -> FleetInstance {
        let mut tags = BTreeMap::new();
        if let Some(ty) = ty {
            tags.insert("moz-type".to_string(), ty.to_string());
        }
        FleetInstance {
            id: format!("i-{}", name),
            name: name.to_string(),
            region: "us-east-1".to_string(),
            private_ip: Some("10.0.0.1".to_string()),
            launch_time: Utc::now(),
            tags,
        }
    }

    fn names(instances: &[FleetInstance]) -> Vec<&str> {
        instances.iter().map(|i| i.name.as_str()).collect()
    }

    #[test]
    fn floor_removes_head_of_each_type() {
        let instances: Vec<_> = (1..=5)
            .map(|n| worker(&format!("bld-ec2-00{}", n), Some("bld")))
            .collect();
        let kept = apply_retention_floor(instances, "moz-type", 2);
        assert_eq!(names(&kept), vec!["bld-ec2-003", "bld-ec2-004", "bld-ec2-005"]);
    }

    #[test]
    fn floor_is_per_type_and_untyped_is_its_own_group() {
        let instances = vec![
            worker("a-ec2-1", Some("bld")),
            worker("b-ec2-1", Some("tst")),
            worker("a-ec2-2", Some("bld")),
            worker("x-ec2-1", None),
            worker("x-ec2-2", None),
        ];
        let kept = apply_retention_floor(instances, "moz-type", 1);
        assert_eq!(names(&kept), vec!["a-ec2-2", "x-ec2-2"]);
    }

    #[test]
    fn zero_floor_keeps_everything() {
        let instances = vec![worker("a-ec2-1", Some("bld")), worker("a-ec2-2", Some("bld"))];
        assert_eq!(apply_retention_floor(instances, "moz-type", 0).len(), 2);
    }

    #[test]
    fn name_pattern_matches_from_start() {
        let re = compile_name_pattern(r".*-ec2-\d+").unwrap();
        assert!(re.is_match("bld-linux64-ec2-001"));
        assert!(re.is_match("tst-linux64-ec2-001-old"));
        assert!(!re.is_match("bld-linux64-spot-001"));
        let strict = compile_name_pattern("bld-").unwrap();
        assert!(!strict.is_match("tst-bld-ec2-1"));
        assert!(compile_name_pattern("(").is_err());
    }

    #[test]
    fn seeded_shuffle_is_a_permutation() {
        let mut a: Vec<_> = (0..20).map(|n| worker(&format!("w-ec2-{}", n), None)).collect();
        let mut b = a.clone();
        shuffle_candidates(&mut a, Some(7));
        shuffle_candidates(&mut b, Some(7));
        assert_eq!(a, b);
        let mut sorted = names(&a).into_iter().map(String::from).collect::<Vec<_>>();
        sorted.sort();
        let mut expected: Vec<String> = (0..20).map(|n| format!("w-ec2-{}", n)).collect();
        expected.sort();
        assert_eq!(sorted, expected);
    }
}
