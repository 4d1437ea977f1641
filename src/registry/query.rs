//! Filtered lookups over groups and instances.
//!
//! A `Filter` is a record of optional fields combined with AND semantics.
//! Instances carry no back-pointer to their group, so instance queries
//! return a flattened `InstanceView` that reconstructs the group context.

use std::path::PathBuf;

use crate::error::{Error, Result};

use super::data::{Group, PersistentData};

pub const HOME_FIELD: &str = "home";
pub const INSTANCE_ID_FIELD: &str = "instance_id";
pub const GROUP_NAME_FIELD: &str = "group_name";
pub const INSTANCE_NAME_FIELD: &str = "instance_name";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub home: Option<PathBuf>,
    pub id: Option<u32>,
    pub group_name: Option<String>,
    pub instance_name: Option<String>,
}

impl Filter {
    pub fn group_name(name: impl Into<String>) -> Self {
        Self {
            group_name: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn home(home: impl Into<PathBuf>) -> Self {
        Self {
            home: Some(home.into()),
            ..Default::default()
        }
    }

    pub fn id(id: u32) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    /// Build a filter from a client-supplied `(field, value)` query list.
    ///
    /// Unknown field names are rejected. A non-numeric instance id reports
    /// the offending string, not an uninitialized number.
    pub fn from_queries<S: AsRef<str>>(queries: &[(S, S)]) -> Result<Self> {
        let mut filter = Filter::default();
        for (field, value) in queries {
            let value = value.as_ref();
            match field.as_ref() {
                HOME_FIELD => filter.home = Some(PathBuf::from(value)),
                INSTANCE_ID_FIELD => {
                    let id: u32 = value.parse().map_err(|_| {
                        Error::invalid(format!("instance id is not a number: \"{}\"", value))
                    })?;
                    filter.id = Some(id);
                }
                GROUP_NAME_FIELD => filter.group_name = Some(value.to_string()),
                INSTANCE_NAME_FIELD => filter.instance_name = Some(value.to_string()),
                other => {
                    return Err(Error::invalid(format!(
                        "unrecognized query field name: \"{}\"",
                        other
                    )))
                }
            }
        }
        Ok(filter)
    }

    pub fn matches_group(&self, group: &Group) -> bool {
        if let Some(home) = &self.home {
            if home != &group.home_directory {
                return false;
            }
        }
        if let Some(name) = &self.group_name {
            if name != &group.name {
                return false;
            }
        }
        if let Some(id) = self.id {
            if group.find_by_id(id).is_none() {
                return false;
            }
        }
        if let Some(instance_name) = &self.instance_name {
            if group.find_by_instance_name(instance_name).is_none() {
                return false;
            }
        }
        true
    }
}

/// One instance flattened together with its group context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceView {
    pub group_name: String,
    pub home_directory: PathBuf,
    pub id: u32,
    pub name: String,
    pub device_name: String,
}

pub fn find_groups(data: &PersistentData, filter: &Filter) -> Vec<Group> {
    data.groups
        .iter()
        .filter(|g| filter.matches_group(g))
        .cloned()
        .collect()
}

pub fn find_instances(data: &PersistentData, filter: &Filter) -> Vec<InstanceView> {
    let mut out = Vec::new();
    for group in &data.groups {
        if let Some(name) = &filter.group_name {
            if name != &group.name {
                continue;
            }
        }
        if let Some(home) = &filter.home {
            if home != &group.home_directory {
                continue;
            }
        }
        for instance in &group.instances {
            if let Some(id) = filter.id {
                if id != instance.id {
                    continue;
                }
            }
            if let Some(instance_name) = &filter.instance_name {
                if instance_name != &instance.name {
                    continue;
                }
            }
            out.push(InstanceView {
                group_name: group.name.clone(),
                home_directory: group.home_directory.clone(),
                id: instance.id,
                name: instance.name.clone(),
                device_name: instance.device_name(&group.name),
            });
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::data::Instance;
    use chrono::Utc;

    fn data_with(groups: Vec<Group>) -> PersistentData {
        PersistentData {
            groups,
            acloud_translator_optout: false,
        }
    }

    fn group(name: &str, home: &str, ids: &[u32]) -> Group {
        Group {
            name: name.into(),
            home_directory: PathBuf::from(home),
            host_artifacts_path: PathBuf::from("/opt/toolkit"),
            product_out_path: "/opt/out".into(),
            is_default_group: false,
            instances: ids
                .iter()
                .map(|id| Instance {
                    id: *id,
                    name: id.to_string(),
                })
                .collect(),
            start_time: Utc::now(),
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        let data = data_with(vec![group("a", "/h1", &[1]), group("b", "/h2", &[2])]);
        assert_eq!(find_groups(&data, &Filter::default()).len(), 2);
        assert_eq!(find_instances(&data, &Filter::default()).len(), 2);
    }

    #[test]
    fn filter_fields_are_and_combined() {
        let data = data_with(vec![group("a", "/h1", &[1, 2]), group("b", "/h2", &[3])]);
        let filter = Filter {
            home: Some(PathBuf::from("/h1")),
            id: Some(3),
            ..Default::default()
        };
        assert!(find_groups(&data, &filter).is_empty());

        let filter = Filter {
            home: Some(PathBuf::from("/h1")),
            id: Some(2),
            ..Default::default()
        };
        assert_eq!(find_groups(&data, &filter).len(), 1);
    }

    #[test]
    fn instance_query_reconstructs_group_context() {
        let data = data_with(vec![group("a", "/h1", &[7])]);
        let views = find_instances(&data, &Filter::id(7));
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].group_name, "a");
        assert_eq!(views[0].device_name, "a-7");
    }

    #[test]
    fn query_list_rejects_unknown_field() {
        let res = Filter::from_queries(&[("favorite_color", "blue")]);
        assert!(matches!(res, Err(Error::Invalid(_))));
    }

    #[test]
    fn query_list_reports_offending_id_string() {
        let err = Filter::from_queries(&[(INSTANCE_ID_FIELD, "not_a_number")]).unwrap_err();
        assert!(err.to_string().contains("not_a_number"));
    }

    #[test]
    fn query_list_builds_combined_filter() {
        let filter =
            Filter::from_queries(&[(GROUP_NAME_FIELD, "a"), (INSTANCE_ID_FIELD, "4")]).unwrap();
        assert_eq!(filter.group_name.as_deref(), Some("a"));
        assert_eq!(filter.id, Some(4));
    }
}
