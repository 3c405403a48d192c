use super::{
    bindings,
    model::{AppPatch, AppSource, ApplicationSpec},
    routes,
};

/// Remediation an attribute change calls for, ordered by weight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeTier {
    #[default]
    None,
    InPlaceUpdate,
    Restart,
    Restage,
}

/// Outcome of comparing the applied configuration with the desired one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub tier: ChangeTier,
    /// Only the attributes that changed.
    pub patch: AppPatch,
    /// The source kind switched: the application must be replaced.
    pub replace: bool,
    pub binary_changed: bool,
    pub bindings_changed: bool,
    pub routes_changed: bool,
    pub stopped_changed: bool,
}

impl ChangeSet {
    /// Changes a blue-green rollout handles by standing up a new application.
    pub fn needs_new_instance(&self) -> bool {
        self.tier >= ChangeTier::Restart
            || self.binary_changed
            || self.bindings_changed
            || self.routes_changed
    }

    pub fn is_empty(&self) -> bool {
        self.tier == ChangeTier::None
            && !self.replace
            && !self.binary_changed
            && !self.bindings_changed
            && !self.routes_changed
            && !self.stopped_changed
    }
}

struct Tracker {
    tier: ChangeTier,
}

impl Tracker {
    fn plain<T: PartialEq + Clone>(&mut self, tier: ChangeTier, old: &T, new: &T) -> Option<T> {
        if old == new {
            return None;
        }
        self.tier = self.tier.max(tier);
        Some(new.clone())
    }

    /// Unset desired values are left to the platform and never count as a change.
    fn computed<T: PartialEq + Clone>(
        &mut self,
        tier: ChangeTier,
        old: &Option<T>,
        new: &Option<T>,
    ) -> Option<T> {
        match new {
            Some(value) if old.as_ref() != Some(value) => {
                self.tier = self.tier.max(tier);
                Some(value.clone())
            }
            _ => None,
        }
    }
}

pub fn classify(old: &ApplicationSpec, new: &ApplicationSpec) -> ChangeSet {
    use ChangeTier::{InPlaceUpdate, Restage, Restart};

    let mut tracker = Tracker {
        tier: ChangeTier::None,
    };
    let mut patch = AppPatch {
        name: tracker.plain(InPlaceUpdate, &old.name, &new.name),
        space: tracker.plain(InPlaceUpdate, &old.space, &new.space),
        instances: tracker.plain(InPlaceUpdate, &old.instances, &new.instances),
        enable_ssh: tracker.computed(InPlaceUpdate, &old.enable_ssh, &new.enable_ssh),

        ports: tracker.computed(Restart, &old.ports, &new.ports),
        memory: tracker.computed(Restart, &old.memory, &new.memory),
        disk_quota: tracker.computed(Restart, &old.disk_quota, &new.disk_quota),
        command: tracker.computed(Restart, &old.command, &new.command),
        health_check_type: tracker.plain(Restart, &old.health_check_type, &new.health_check_type),
        health_check_http_endpoint: tracker.computed(
            Restart,
            &old.health_check_http_endpoint,
            &new.health_check_http_endpoint,
        ),
        health_check_timeout: tracker.computed(
            Restart,
            &old.health_check_timeout,
            &new.health_check_timeout,
        ),

        buildpack: tracker.computed(Restage, &old.buildpack, &new.buildpack),
        stack: tracker.computed(Restage, &old.stack, &new.stack),
        environment: tracker.computed(Restage, &old.environment, &new.environment),
        ..Default::default()
    };

    let mut binary_changed = false;
    let replace = old.source.kind() != new.source.kind();
    if !replace {
        match (&old.source, &new.source) {
            (AppSource::Docker(old_docker), AppSource::Docker(new_docker)) => {
                patch.docker_image = tracker.plain(InPlaceUpdate, &old_docker.image, &new_docker.image);
                patch.docker_credentials = tracker.computed(
                    InPlaceUpdate,
                    &old_docker.credentials,
                    &new_docker.credentials,
                );
            }
            (old_source, new_source) => {
                binary_changed = old_source != new_source || old.add_content != new.add_content;
            }
        }
    }

    let (unbound, bound) = bindings::diff(&old.service_bindings, &new.service_bindings);
    ChangeSet {
        tier: tracker.tier,
        patch,
        replace,
        binary_changed,
        bindings_changed: !unbound.is_empty() || !bound.is_empty(),
        routes_changed: routes::routes_differ(old.routes.as_ref(), new.routes.as_ref()),
        stopped_changed: old.stopped != new.stopped,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use map_macro::btree_map;
    use rstest::rstest;

    use super::*;
    use crate::domain::model::{
        DockerSource, GitSource, HealthCheckType, RouteConfig, RouteEntry, ServiceBinding,
    };

    fn base() -> ApplicationSpec {
        let mut spec = ApplicationSpec::new(
            "web",
            "space-1",
            AppSource::Url("file:///srv/web".to_string()),
        );
        spec.memory = Some(256);
        spec.buildpack = Some("ruby_buildpack".to_string());
        spec.environment = Some(btree_map! { "MODE".to_string() => "prod".to_string() });
        spec
    }

    #[rstest]
    #[case::name(|s: &mut ApplicationSpec| s.name = "web-2".to_string(), ChangeTier::InPlaceUpdate)]
    #[case::space(|s: &mut ApplicationSpec| s.space = "space-2".to_string(), ChangeTier::InPlaceUpdate)]
    #[case::instances(|s: &mut ApplicationSpec| s.instances = 3, ChangeTier::InPlaceUpdate)]
    #[case::ssh(|s: &mut ApplicationSpec| s.enable_ssh = Some(true), ChangeTier::InPlaceUpdate)]
    #[case::ports(|s: &mut ApplicationSpec| s.ports = Some(BTreeSet::from([8080, 9090])), ChangeTier::Restart)]
    #[case::memory(|s: &mut ApplicationSpec| s.memory = Some(512), ChangeTier::Restart)]
    #[case::disk(|s: &mut ApplicationSpec| s.disk_quota = Some(2048), ChangeTier::Restart)]
    #[case::command(|s: &mut ApplicationSpec| s.command = Some("bin/serve".to_string()), ChangeTier::Restart)]
    #[case::health_check(|s: &mut ApplicationSpec| s.health_check_type = HealthCheckType::Http, ChangeTier::Restart)]
    #[case::health_endpoint(|s: &mut ApplicationSpec| s.health_check_http_endpoint = Some("/health".to_string()), ChangeTier::Restart)]
    #[case::buildpack(|s: &mut ApplicationSpec| s.buildpack = Some("go_buildpack".to_string()), ChangeTier::Restage)]
    #[case::stack(|s: &mut ApplicationSpec| s.stack = Some("cflinuxfs4".to_string()), ChangeTier::Restage)]
    #[case::environment(|s: &mut ApplicationSpec| s.environment = Some(BTreeMap::new()), ChangeTier::Restage)]
    fn single_field_changes_map_to_their_tier(
        #[case] change: fn(&mut ApplicationSpec),
        #[case] expected: ChangeTier,
    ) {
        let old = base();
        let mut new = base();
        change(&mut new);

        let changes = classify(&old, &new);
        assert_eq!(changes.tier, expected);
        assert!(!changes.patch.is_empty());
        assert!(!changes.replace);
    }

    #[test]
    fn identical_specs_are_a_no_op() {
        let changes = classify(&base(), &base());
        assert!(changes.is_empty());
        assert!(changes.patch.is_empty());
    }

    #[test]
    fn instance_count_alone_is_an_in_place_update() {
        let old = base();
        let mut new = base();
        new.instances = 4;

        let changes = classify(&old, &new);
        assert_eq!(changes.tier, ChangeTier::InPlaceUpdate);
        assert_eq!(changes.patch, AppPatch::scale(4));
        assert!(!changes.needs_new_instance());
    }

    #[test]
    fn highest_tier_wins() {
        let old = base();
        let mut new = base();
        new.instances = 2;
        new.memory = Some(1024);
        new.environment = Some(btree_map! { "MODE".to_string() => "dev".to_string() });

        let changes = classify(&old, &new);
        assert!(changes.tier >= ChangeTier::Restage);
        assert_eq!(changes.patch.instances, Some(2));
        assert_eq!(changes.patch.memory, Some(1024));
        assert!(changes.patch.environment.is_some());
        assert!(changes.patch.name.is_none());
    }

    #[test]
    fn unset_computed_attributes_are_not_changes() {
        let old = base();
        let mut new = base();
        new.memory = None;
        new.buildpack = None;

        assert!(classify(&old, &new).is_empty());
    }

    #[test]
    fn switching_source_kind_forces_replacement() {
        let old = base();
        let mut new = base();
        new.source = AppSource::Docker(DockerSource {
            image: "nginx:1.27".to_string(),
            credentials: None,
        });

        let changes = classify(&old, &new);
        assert!(changes.replace);
        assert!(!changes.binary_changed);

        new.source = AppSource::Git(GitSource {
            url: "https://example.com/web.git".to_string(),
            branch: None,
            tag: None,
            user: None,
            password: None,
            key: None,
        });
        assert!(classify(&old, &new).replace);
    }

    #[test]
    fn docker_image_change_is_pushed_in_place() {
        let mut old = base();
        old.source = AppSource::Docker(DockerSource {
            image: "nginx:1.26".to_string(),
            credentials: None,
        });
        let mut new = old.clone();
        new.source = AppSource::Docker(DockerSource {
            image: "nginx:1.27".to_string(),
            credentials: None,
        });

        let changes = classify(&old, &new);
        assert_eq!(changes.tier, ChangeTier::InPlaceUpdate);
        assert_eq!(changes.patch.docker_image.as_deref(), Some("nginx:1.27"));
        assert!(!changes.binary_changed);
    }

    #[test]
    fn new_bits_bindings_and_routes_are_flagged() {
        let old = base();
        let mut new = base();
        new.source = AppSource::Url("file:///srv/web-v2".to_string());
        new.service_bindings = vec![ServiceBinding::new("db")];
        new.routes = Some(RouteConfig::Set(BTreeSet::from([RouteEntry::new("route-1")])));

        let changes = classify(&old, &new);
        assert_eq!(changes.tier, ChangeTier::None);
        assert!(changes.binary_changed);
        assert!(changes.bindings_changed);
        assert!(changes.routes_changed);
        assert!(changes.needs_new_instance());
    }

    #[test]
    fn binding_ids_do_not_count_as_changes() {
        let mut old = base();
        let mut bound = ServiceBinding::new("db");
        bound.binding_id = Some("binding-1".to_string());
        old.service_bindings = vec![bound];
        let mut new = base();
        new.service_bindings = vec![ServiceBinding::new("db")];

        assert!(!classify(&old, &new).bindings_changed);
    }
}
