use std::sync::Arc;

use vmshape_core::object::{CLUSTER_INSTANCETYPE_KIND, INSTANCETYPE_KIND, PREFERENCE_KIND};
use vmshape_core::{Error, Instancetype, InstancetypeFamily, InstancetypeSpec, Matcher, Preference, PreferenceFamily, PreferenceSpec, VirtualMachine};
use vmshape_find::{Sources, SpecFinder};
use vmshape_revision::RevisionHandler;
use vmshape_store::{MemCache, MemObjectClient, MemRevisionStore};

struct World {
    cluster_cache: Arc<MemCache<Instancetype>>,
    cluster_client: Arc<MemObjectClient<Instancetype>>,
    ns_client: Arc<MemObjectClient<Instancetype>>,
    revisions: Arc<MemRevisionStore>,
}

impl World {
    fn new() -> Self {
        Self {
            cluster_cache: Arc::new(MemCache::new()),
            cluster_client: Arc::new(MemObjectClient::new()),
            ns_client: Arc::new(MemObjectClient::new()),
            revisions: Arc::new(MemRevisionStore::new()),
        }
    }

    fn finder(&self) -> SpecFinder<InstancetypeFamily> {
        SpecFinder::new(
            Sources::new(self.cluster_cache.clone(), self.cluster_client.clone()),
            Sources::new(Arc::new(MemCache::new()), self.ns_client.clone()),
            self.revisions.clone(),
        )
    }
}

fn it(kind: &str, ns: Option<&str>, name: &str, guest: u32) -> Instancetype {
    let mut spec = InstancetypeSpec::default();
    spec.cpu.guest = guest;
    let mut o = Instancetype::new(kind, ns, name, spec);
    o.metadata.uid = Some(format!("{}-uid", name));
    o.metadata.generation = Some(1);
    o
}

fn vm_with(m: Option<Matcher>) -> VirtualMachine {
    let mut vm = VirtualMachine::new("default", "vm");
    vm.metadata.uid = Some("vm-uid".into());
    vm.spec.instancetype = m;
    vm
}

#[tokio::test]
async fn no_reference_finds_nothing() {
    let w = World::new();
    assert!(w.finder().find(&vm_with(None)).await.unwrap().is_none());
    assert!(w.finder().find(&vm_with(Some(Matcher::default()))).await.unwrap().is_none());
    assert_eq!(w.cluster_client.fetches(), 0);
}

#[tokio::test]
async fn missing_cluster_instancetype_is_not_found() {
    let w = World::new();
    let vm = vm_with(Some(Matcher::named("large", CLUSTER_INSTANCETYPE_KIND)));
    let err = w.finder().find(&vm).await.unwrap_err();
    match err {
        Error::ReferenceNotFound { kind, name } => {
            assert_eq!(kind, CLUSTER_INSTANCETYPE_KIND);
            assert_eq!(name, "large");
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn cache_hit_skips_live_client() {
    let w = World::new();
    w.cluster_cache.upsert(None, "u1", it(CLUSTER_INSTANCETYPE_KIND, None, "u1", 2));
    let spec = w.finder().find(&vm_with(Some(Matcher::named("u1", "")))).await.unwrap().unwrap();
    assert_eq!(spec.cpu.guest, 2);
    assert_eq!(w.cluster_client.fetches(), 0);
}

#[tokio::test]
async fn namespaced_kind_uses_vm_namespace() {
    let w = World::new();
    w.ns_client.insert(Some("other"), "u1", it(INSTANCETYPE_KIND, Some("other"), "u1", 1));
    w.ns_client.insert(Some("default"), "u1", it(INSTANCETYPE_KIND, Some("default"), "u1", 4));
    let vm = vm_with(Some(Matcher::named("u1", "virtualmachineinstancetypes")));
    assert_eq!(w.finder().find(&vm).await.unwrap().unwrap().cpu.guest, 4);
}

#[tokio::test]
async fn unknown_kind_is_rejected() {
    let w = World::new();
    let vm = vm_with(Some(Matcher::named("u1", PREFERENCE_KIND)));
    assert!(matches!(w.finder().find(&vm).await, Err(Error::UnexpectedKind { .. })));
}

#[tokio::test]
async fn pinned_revision_wins_over_live_drift() {
    let w = World::new();
    w.cluster_client.insert(None, "u1", it(CLUSTER_INSTANCETYPE_KIND, None, "u1", 2));
    let finder = w.finder();
    let mut vm = vm_with(Some(Matcher::named("u1", "")));
    let object = finder.find_object(&vm).await.unwrap().unwrap();
    RevisionHandler::new(w.revisions.clone()).pin::<InstancetypeFamily>(&mut vm, &object).await.unwrap();

    // the live object changes after pinning
    w.cluster_client.insert(None, "u1", it(CLUSTER_INSTANCETYPE_KIND, None, "u1", 16));
    let fetches = w.cluster_client.fetches();
    let spec = finder.find(&vm).await.unwrap().unwrap();
    assert_eq!(spec.cpu.guest, 2);
    assert_eq!(w.cluster_client.fetches(), fetches);
}

#[tokio::test]
async fn pinned_revision_missing_does_not_fall_back() {
    let w = World::new();
    w.cluster_client.insert(None, "u1", it(CLUSTER_INSTANCETYPE_KIND, None, "u1", 2));
    let mut m = Matcher::named("u1", "");
    m.revision_name = "vm-u1-gone".into();
    let err = w.finder().find(&vm_with(Some(m))).await.unwrap_err();
    assert!(matches!(err, Error::PinnedRevisionMissing { .. }));
    assert_eq!(w.cluster_client.fetches(), 0);
}

#[tokio::test]
async fn pinned_revision_of_other_family_is_rejected() {
    let w = World::new();
    let mut vm = vm_with(None);
    vm.spec.preference = Some(Matcher::named("p1", ""));
    let mut pref = Preference::new(vmshape_core::object::CLUSTER_PREFERENCE_KIND, None, "p1", PreferenceSpec::default());
    pref.metadata.uid = Some("p1-uid".into());
    let name = RevisionHandler::new(w.revisions.clone()).pin::<PreferenceFamily>(&mut vm, &pref).await.unwrap().unwrap();

    let mut m = Matcher::named("u1", "");
    m.revision_name = name;
    let err = w.finder().find(&vm_with(Some(m))).await.unwrap_err();
    assert!(matches!(err, Error::UnexpectedRevisionPayload { .. }));
}
