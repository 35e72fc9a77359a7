// ABOUTME: Resolves the descendants of a process for tree-wide termination
// ABOUTME: sysinfo-backed walk over a process table snapshot

use std::collections::{HashMap, HashSet, VecDeque};
use sysinfo::System;
use tracing::debug;

/// Platform seam for child-PID enumeration.
pub trait ProcessTree: Send + Sync {
    /// All transitive descendants of `pid`, breadth first, excluding `pid` itself.
    fn descendants_of(&self, pid: u32) -> Vec<u32>;
}

/// Walks a fresh snapshot of the OS process table.
#[derive(Debug, Clone, Default)]
pub struct SystemProcessTree;

impl ProcessTree for SystemProcessTree {
    fn descendants_of(&self, pid: u32) -> Vec<u32> {
        let mut system = System::new();
        system.refresh_processes();

        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (child_pid, process) in system.processes() {
            if let Some(parent) = process.parent() {
                children
                    .entry(parent.as_u32())
                    .or_default()
                    .push(child_pid.as_u32());
            }
        }

        let descendants = collect_descendants(&children, pid);
        debug!("PID {} has {} descendants", pid, descendants.len());
        descendants
    }
}

/// Breadth-first walk of a parent → children map. Cycles and the root are never returned.
pub fn collect_descendants(children: &HashMap<u32, Vec<u32>>, root: u32) -> Vec<u32> {
    let mut descendants = Vec::new();
    let mut seen = HashSet::from([root]);
    let mut queue = VecDeque::from([root]);

    while let Some(pid) = queue.pop_front() {
        let Some(kids) = children.get(&pid) else {
            continue;
        };
        let mut kids = kids.clone();
        kids.sort_unstable();
        for kid in kids {
            if seen.insert(kid) {
                descendants.push(kid);
                queue.push_back(kid);
            }
        }
    }

    descendants
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(edges: &[(u32, u32)]) -> HashMap<u32, Vec<u32>> {
        let mut map: HashMap<u32, Vec<u32>> = HashMap::new();
        for &(parent, child) in edges {
            map.entry(parent).or_default().push(child);
        }
        map
    }

    #[test]
    fn test_breadth_first_order() {
        let children = table(&[(1, 3), (1, 2), (2, 4), (3, 5), (4, 6)]);
        assert_eq!(collect_descendants(&children, 1), vec![2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_leaf_has_no_descendants() {
        let children = table(&[(1, 2)]);
        assert!(collect_descendants(&children, 2).is_empty());
        assert!(collect_descendants(&children, 42).is_empty());
    }

    #[test]
    fn test_cycles_terminate() {
        let children = table(&[(1, 2), (2, 3), (3, 1), (3, 2)]);
        assert_eq!(collect_descendants(&children, 1), vec![2, 3]);
    }

    #[cfg(unix)]
    #[test]
    fn test_finds_real_grandchild() {
        let mut child = std::process::Command::new("sh")
            .args(["-c", "sleep 30 & wait"])
            .spawn()
            .unwrap();
        let pid = child.id();

        let mut descendants = Vec::new();
        for _ in 0..50 {
            descendants = SystemProcessTree.descendants_of(pid);
            if !descendants.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }

        for descendant in &descendants {
            let _ = std::process::Command::new("kill").arg(descendant.to_string()).status();
        }
        let _ = child.kill();
        let _ = child.wait();

        assert_eq!(descendants.len(), 1);
    }
}
