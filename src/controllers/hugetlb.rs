//! `hugetlb` controller: `hugetlb.<size>.max`, `hugetlb.<size>.current`

use std::sync::Arc;

use async_trait::async_trait;

use super::Controller;
use crate::cgroupfs::CgroupFs;
use crate::container::{ContainerId, Limits, ResourceStatistics, Resources};
use crate::errors::Result;

pub struct HugetlbController {
    fs: Arc<CgroupFs>,
}

impl HugetlbController {
    pub fn new(fs: Arc<CgroupFs>) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Controller for HugetlbController {
    fn name(&self) -> &'static str {
        "hugetlb"
    }

    async fn update(
        &self,
        _container_id: &ContainerId,
        cgroup: &str,
        requests: &Resources,
        _limits: &Limits,
    ) -> Result<()> {
        for (size, bytes) in &requests.hugetlb {
            self.fs
                .write_control(cgroup, &format!("hugetlb.{size}.max"), &bytes.to_string())?;
        }
        Ok(())
    }

    async fn usage(&self, _container_id: &ContainerId, cgroup: &str) -> Result<ResourceStatistics> {
        let mut stats = ResourceStatistics::default();

        // The kernel exposes one file set per supported page size; report
        // whatever is there rather than tracking requested sizes.
        let dir = self.fs.path(cgroup);
        for entry in std::fs::read_dir(&dir).into_iter().flatten().flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(size) = name
                .strip_prefix("hugetlb.")
                .and_then(|rest| rest.strip_suffix(".current"))
            else {
                continue;
            };
            if let Ok(content) = std::fs::read_to_string(entry.path())
                && let Ok(bytes) = content.trim().parse::<u64>()
            {
                stats.hugetlb_bytes.insert(size.to_string(), bytes);
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_update_and_usage_per_page_size() {
        let tmp = tempdir().unwrap();
        let fs = CgroupFs::with_mount(tmp.path());
        fs.create("containers/c1", true).unwrap();

        let controller = HugetlbController::new(Arc::new(fs));
        let id = ContainerId::new("c1").unwrap();

        let mut hugetlb = BTreeMap::new();
        hugetlb.insert("2MB".to_string(), 4 * 1024 * 1024_u64);
        let requests = Resources {
            hugetlb,
            ..Default::default()
        };
        controller
            .update(&id, "containers/c1", &requests, &Limits::default())
            .await
            .unwrap();

        let dir = tmp.path().join("containers/c1");
        assert_eq!(
            std::fs::read_to_string(dir.join("hugetlb.2MB.max")).unwrap(),
            "4194304"
        );

        std::fs::write(dir.join("hugetlb.2MB.current"), "2097152\n").unwrap();
        let stats = controller.usage(&id, "containers/c1").await.unwrap();
        assert_eq!(stats.hugetlb_bytes.get("2MB"), Some(&2097152));
    }
}
