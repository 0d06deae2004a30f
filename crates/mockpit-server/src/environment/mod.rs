//! Environment model and folder hierarchy handling.
//!
//! This module provides:
//! - The serde types describing an environment (see [`types`])
//! - Depth-first route ordering through the folder hierarchy
//! - Repair of dangling references and orphaned routes or folders

mod types;

pub use types::*;

use std::collections::HashSet;
use tracing::warn;

impl Environment {
    /// Routes in folder order: root children first, walking folders depth first.
    pub fn ordered_routes(&self) -> Vec<&Route> {
        let mut ordered = Vec::with_capacity(self.routes.len());
        let mut visited_folders = HashSet::new();
        self.collect_routes(&self.root_children, &mut visited_folders, &mut ordered);
        ordered
    }

    fn collect_routes<'a>(
        &'a self,
        children: &'a [FolderChild],
        visited_folders: &mut HashSet<&'a str>,
        ordered: &mut Vec<&'a Route>,
    ) {
        for child in children {
            match child.kind {
                FolderChildKind::Route => {
                    if let Some(route) = self.routes.iter().find(|r| r.uuid == child.uuid) {
                        ordered.push(route);
                    }
                }
                FolderChildKind::Folder => {
                    // A folder listed twice (or inside itself) is walked once
                    if !visited_folders.insert(child.uuid.as_str()) {
                        continue;
                    }
                    if let Some(folder) = self.folders.iter().find(|f| f.uuid == child.uuid) {
                        self.collect_routes(&folder.children, visited_folders, ordered);
                    }
                }
            }
        }
    }

    /// Drop references to missing routes or folders and re-attach every
    /// unreferenced route or folder at the end of the root children.
    ///
    /// Returns the number of entities that were re-attached.
    pub fn repair_orphans(&mut self) -> usize {
        let route_ids: HashSet<String> = self.routes.iter().map(|r| r.uuid.clone()).collect();
        let folder_ids: HashSet<String> = self.folders.iter().map(|f| f.uuid.clone()).collect();
        let resolves = |child: &FolderChild| match child.kind {
            FolderChildKind::Route => route_ids.contains(&child.uuid),
            FolderChildKind::Folder => folder_ids.contains(&child.uuid),
        };

        self.root_children.retain(|child| resolves(child));
        for folder in &mut self.folders {
            folder.children.retain(|child| resolves(child));
        }

        let referenced: HashSet<(FolderChildKind, String)> = self
            .root_children
            .iter()
            .chain(self.folders.iter().flat_map(|f| f.children.iter()))
            .map(|child| (child.kind, child.uuid.clone()))
            .collect();

        let mut reattached = 0;
        for folder in &self.folders {
            if !referenced.contains(&(FolderChildKind::Folder, folder.uuid.clone())) {
                warn!("Re-attaching orphaned folder '{}' at the root", folder.uuid);
                self.root_children.push(FolderChild::folder(folder.uuid.clone()));
                reattached += 1;
            }
        }
        for route in &self.routes {
            if !referenced.contains(&(FolderChildKind::Route, route.uuid.clone())) {
                warn!("Re-attaching orphaned route '{}' at the root", route.uuid);
                self.root_children.push(FolderChild::route(route.uuid.clone()));
                reattached += 1;
            }
        }
        reattached
    }

    /// Look a data bucket up by its short id or its name.
    pub fn find_bucket(&self, id_or_name: &str) -> Option<&DataBucket> {
        self.data
            .iter()
            .find(|b| b.id == id_or_name)
            .or_else(|| self.data.iter().find(|b| b.name == id_or_name))
    }

    pub fn find_callback(&self, uuid: &str) -> Option<&Callback> {
        self.callbacks.iter().find(|c| c.uuid == uuid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(uuid: &str, endpoint: &str) -> Route {
        Route {
            uuid: uuid.to_string(),
            kind: RouteKind::Http,
            documentation: String::new(),
            method: RouteMethod::Get,
            endpoint: endpoint.to_string(),
            responses: vec![RouteResponse::default()],
            enabled: true,
            response_mode: None,
        }
    }

    fn folder(uuid: &str, children: Vec<FolderChild>) -> Folder {
        Folder {
            uuid: uuid.to_string(),
            name: uuid.to_string(),
            children,
        }
    }

    #[test]
    fn test_ordered_routes_walks_folders_depth_first() {
        let env = Environment {
            routes: vec![route("a", "a"), route("b", "b"), route("c", "c")],
            folders: vec![folder("f1", vec![FolderChild::route("b")])],
            root_children: vec![
                FolderChild::route("c"),
                FolderChild::folder("f1"),
                FolderChild::route("a"),
            ],
            ..Default::default()
        };
        let ids: Vec<&str> = env.ordered_routes().iter().map(|r| r.uuid.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_ordered_routes_survives_folder_cycle() {
        let env = Environment {
            routes: vec![route("a", "a")],
            folders: vec![folder(
                "f1",
                vec![FolderChild::folder("f1"), FolderChild::route("a")],
            )],
            root_children: vec![FolderChild::folder("f1")],
            ..Default::default()
        };
        assert_eq!(env.ordered_routes().len(), 1);
    }

    #[test]
    fn test_repair_reattaches_orphans_and_drops_dangling() {
        let mut env = Environment {
            routes: vec![route("a", "a"), route("orphan", "o")],
            folders: vec![
                folder("f1", vec![FolderChild::route("missing")]),
                folder("lost", vec![]),
            ],
            root_children: vec![FolderChild::route("a"), FolderChild::folder("f1")],
            ..Default::default()
        };
        let reattached = env.repair_orphans();
        assert_eq!(reattached, 2);
        assert!(env.folders[0].children.is_empty());
        assert_eq!(
            env.root_children,
            vec![
                FolderChild::route("a"),
                FolderChild::folder("f1"),
                FolderChild::folder("lost"),
                FolderChild::route("orphan"),
            ]
        );
        assert_eq!(env.ordered_routes().len(), 2);
    }

    #[test]
    fn test_find_bucket_by_id_or_name() {
        let env = Environment {
            data: vec![DataBucket {
                uuid: "u".into(),
                id: "x1y2".into(),
                name: "Users".into(),
                documentation: String::new(),
                value: "[]".into(),
            }],
            ..Default::default()
        };
        assert!(env.find_bucket("x1y2").is_some());
        assert!(env.find_bucket("Users").is_some());
        assert!(env.find_bucket("nope").is_none());
    }
}
