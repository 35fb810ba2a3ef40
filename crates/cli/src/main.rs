use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};
use vmshape_api::{generate_revision_name, Collaborators, InstancetypeMethods, MemCollaborators, Methods};
use vmshape_core::{ConflictKind, EngineConfig, Instancetype, InstancetypeSpec, Matcher, Preference, PreferenceSpec, VirtualMachine};
use vmshape_find::Sources;
use vmshape_kubehub::{
    get_virtual_machine, prime_cache, shared_client, KubeObjectClient, KubeRevisionStore, KubeVolumeSourceClient, CLUSTER_INSTANCETYPES,
    CLUSTER_PREFERENCES, INSTANCETYPES, PREFERENCES,
};
use vmshape_store::{MemCache, SourceKind, VolumeSource};

#[derive(Parser, Debug)]
#[command(name = "vmshapectl", version, about = "Resolve and apply VirtualMachine instance types and preferences")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace of the VirtualMachine
    #[arg(long = "ns", global = true, default_value = "default")]
    namespace: String,

    /// Read instancetypes, preferences, revisions and volume sources from a
    /// multi-document YAML file instead of the cluster
    #[arg(long = "objects", global = true)]
    objects: Option<PathBuf>,

    /// List instancetypes and preferences into the cache before resolving
    #[arg(long = "prime-caches", global = true, action = ArgAction::SetTrue)]
    prime_caches: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
    Yaml,
}

#[derive(Args, Debug)]
struct VmArg {
    /// VirtualMachine name (in --ns, or among --objects)
    name: Option<String>,
    /// Read the VirtualMachine from a YAML/JSON file
    #[arg(short = 'f', long = "file", conflicts_with = "name")]
    file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the VirtualMachine with instancetype and preference merged in
    Expand(VmArg),
    /// Print the referenced instancetype and preference specs
    Find(VmArg),
    /// Check preference requirements against the instancetype or guest
    Check(VmArg),
    /// Fill references from inferFromVolume hints
    Infer(VmArg),
    /// Store ControllerRevisions for unpinned references and print their names
    Pin(VmArg),
    /// Rewrite legacy ControllerRevisions owned by the VirtualMachine
    Upgrade(VmArg),
    /// Compute a ControllerRevision name
    RevisionName {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        resource: String,
        #[arg(long = "resource-version", default_value = "v1beta1")]
        resource_version: String,
        #[arg(long)]
        uid: String,
        #[arg(long, default_value_t = 1)]
        generation: i64,
    },
}

fn init_tracing() {
    let env = std::env::var("VMSHAPE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VMSHAPE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid VMSHAPE_METRICS_ADDR; expected host:port");
        }
    }
}

/// What the engine reads from, plus the VirtualMachines found in `--objects`.
struct Backend {
    methods: InstancetypeMethods,
    client: Option<kube::Client>,
    vms: Vec<VirtualMachine>,
}

fn read_documents(path: &Path) -> Result<Vec<Value>> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(&text) {
        let v = Value::deserialize(doc).with_context(|| format!("parsing {}", path.display()))?;
        if !v.is_null() {
            out.push(v);
        }
    }
    Ok(out)
}

fn load_objects(mem: &MemCollaborators, path: &Path) -> Result<Vec<VirtualMachine>> {
    let mut vms = Vec::new();
    for doc in read_documents(path)? {
        let kind = doc.get("kind").and_then(Value::as_str).unwrap_or_default().to_string();
        let ns = doc.pointer("/metadata/namespace").and_then(Value::as_str).unwrap_or("default").to_string();
        let name = doc.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default().to_string();
        match kind.as_str() {
            "VirtualMachineInstancetype" | "VirtualMachineClusterInstancetype" => {
                mem.insert_instancetype(serde_json::from_value::<Instancetype>(doc).with_context(|| format!("decoding {} {}", kind, name))?)
            }
            "VirtualMachinePreference" | "VirtualMachineClusterPreference" => {
                mem.insert_preference(serde_json::from_value::<Preference>(doc).with_context(|| format!("decoding {} {}", kind, name))?)
            }
            "ControllerRevision" => mem.revisions.seed(serde_json::from_value(doc).with_context(|| format!("decoding ControllerRevision {}", name))?)?,
            "VirtualMachine" => {
                let mut vm: VirtualMachine = serde_json::from_value(doc).with_context(|| format!("decoding VirtualMachine {}", name))?;
                vm.metadata.namespace.get_or_insert(ns);
                vms.push(vm);
            }
            "PersistentVolumeClaim" | "DataVolume" | "DataSource" => {
                let sk = match kind.as_str() {
                    "PersistentVolumeClaim" => SourceKind::PersistentVolumeClaim,
                    "DataVolume" => SourceKind::DataVolume,
                    _ => SourceKind::DataSource,
                };
                let labels = doc
                    .pointer("/metadata/labels")
                    .map(|l| serde_json::from_value(l.clone()))
                    .transpose()
                    .with_context(|| format!("decoding labels of {} {}", kind, name))?
                    .unwrap_or_default();
                let next = vmshape_kubehub::next_source(sk, &ns, &doc);
                mem.volume_sources.insert(&ns, &name, VolumeSource { kind: sk, labels, next });
            }
            other => info!(kind = %other, name = %name, "skipping object"),
        }
    }
    Ok(vms)
}

async fn backend(cli: &Cli) -> Result<Backend> {
    let config = EngineConfig::from_env();
    if let Some(path) = &cli.objects {
        let mem = MemCollaborators::new();
        let vms = load_objects(&mem, path)?;
        info!(path = %path.display(), vms = vms.len(), "objects loaded");
        return Ok(Backend { methods: InstancetypeMethods::new(mem.collaborators(), config), client: None, vms });
    }

    let client = shared_client().await?;
    let cit = Arc::new(MemCache::<Instancetype>::new());
    let it = Arc::new(MemCache::<Instancetype>::new());
    let cpref = Arc::new(MemCache::<Preference>::new());
    let pref = Arc::new(MemCache::<Preference>::new());
    if cli.prime_caches {
        prime_cache(client.clone(), &CLUSTER_INSTANCETYPES, &cit).await?;
        prime_cache(client.clone(), &INSTANCETYPES, &it).await?;
        prime_cache(client.clone(), &CLUSTER_PREFERENCES, &cpref).await?;
        prime_cache(client.clone(), &PREFERENCES, &pref).await?;
    }
    let c = Collaborators {
        cluster_instancetypes: Sources::new(cit, Arc::new(KubeObjectClient::new(client.clone(), &CLUSTER_INSTANCETYPES))),
        instancetypes: Sources::new(it, Arc::new(KubeObjectClient::new(client.clone(), &INSTANCETYPES))),
        cluster_preferences: Sources::new(cpref, Arc::new(KubeObjectClient::new(client.clone(), &CLUSTER_PREFERENCES))),
        preferences: Sources::new(pref, Arc::new(KubeObjectClient::new(client.clone(), &PREFERENCES))),
        revisions: Arc::new(KubeRevisionStore::new(client.clone())),
        revision_cache: None,
        volume_sources: Arc::new(KubeVolumeSourceClient::new(client.clone())),
    };
    Ok(Backend { methods: InstancetypeMethods::new(c, config), client: Some(client), vms: Vec::new() })
}

async fn load_vm(b: &Backend, arg: &VmArg, namespace: &str) -> Result<VirtualMachine> {
    if let Some(path) = &arg.file {
        let mut docs = read_documents(path)?;
        let doc = docs.pop().ok_or_else(|| anyhow!("{} holds no object", path.display()))?;
        return serde_json::from_value(doc).with_context(|| format!("decoding VirtualMachine from {}", path.display()));
    }
    let name = arg.name.as_deref().ok_or_else(|| anyhow!("pass a VirtualMachine name or -f FILE"))?;
    if let Some(client) = &b.client {
        return get_virtual_machine(client.clone(), namespace, name).await;
    }
    b.vms
        .iter()
        .find(|v| v.name() == name && v.namespace() == namespace)
        .cloned()
        .ok_or_else(|| anyhow!("VirtualMachine {}/{} not found in --objects", namespace, name))
}

fn print<T: Serialize>(output: Output, value: &T, human: impl FnOnce() -> String) -> Result<()> {
    match output {
        Output::Human => println!("{}", human()),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

#[derive(Serialize)]
struct Found {
    instancetype: Option<InstancetypeSpec>,
    preference: Option<PreferenceSpec>,
}

#[derive(Serialize)]
struct References<'a> {
    instancetype: Option<&'a Matcher>,
    preference: Option<&'a Matcher>,
}

fn render_ref(label: &str, m: Option<&Matcher>) -> String {
    match m {
        None => format!("{}: -", label),
        Some(m) if m.revision_name.is_empty() => format!("{}: {} ({})", label, m.name, if m.kind.is_empty() { "-" } else { &m.kind }),
        Some(m) => format!("{}: {} ({}) @ {}", label, m.name, if m.kind.is_empty() { "-" } else { &m.kind }, m.revision_name),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let arg = match &cli.command {
        Commands::RevisionName { owner, resource, resource_version, uid, generation } => {
            let name = generate_revision_name(owner, resource, resource_version, uid, *generation)?;
            return print(cli.output, &name, || name.clone());
        }
        Commands::Expand(a) | Commands::Find(a) | Commands::Check(a) | Commands::Infer(a) | Commands::Pin(a) | Commands::Upgrade(a) => a,
    };

    let b = backend(&cli).await?;
    let ns = cli.namespace.as_str();
    let mut vm = load_vm(&b, arg, ns).await?;
    match &cli.command {
        Commands::Expand(_) => {
            let out = b.methods.expand(&vm).await?;
            // Human output is YAML too; a full object has no better table.
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&out)?),
                _ => print!("{}", serde_yaml::to_string(&out)?),
            }
        }
        Commands::Find(_) => {
            let found = Found { instancetype: b.methods.find_instancetype_spec(&vm).await?, preference: b.methods.find_preference_spec(&vm).await? };
            print(cli.output, &found, || {
                let it = match &found.instancetype {
                    Some(s) => format!("instancetype: {} vCPU, {} memory", s.cpu.guest, s.memory.guest.0),
                    None => "instancetype: -".to_string(),
                };
                let pref = if found.preference.is_some() { "preference: found" } else { "preference: -" };
                format!("{}\n{}", it, pref)
            })?;
        }
        Commands::Check(_) => {
            let it = b.methods.find_instancetype_spec(&vm).await?;
            let pref = b.methods.find_preference_spec(&vm).await?;
            let empty = Default::default();
            let vmi = vm.spec.template.as_ref().map(|t| &t.spec).unwrap_or(&empty);
            let conflicts = b.methods.check_preference_requirements(it.as_ref(), pref.as_ref(), vmi)?;
            print(cli.output, &conflicts, || {
                if conflicts.is_empty() {
                    return "requirements met".to_string();
                }
                conflicts
                    .iter()
                    .map(|c| match &c.kind {
                        ConflictKind::Requirement { message } => format!("{}: {}", c.path, message),
                        ConflictKind::Ownership => c.path.to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
            if !conflicts.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Infer(_) | Commands::Pin(_) => {
            if matches!(cli.command, Commands::Infer(_)) {
                b.methods.infer_default_instancetype(&mut vm).await?;
                b.methods.infer_default_preference(&mut vm).await?;
            } else {
                b.methods.store_revisions(&mut vm).await?;
            }
            let refs = References { instancetype: vm.spec.instancetype.as_ref(), preference: vm.spec.preference.as_ref() };
            print(cli.output, &refs, || format!("{}\n{}", render_ref("instancetype", refs.instancetype), render_ref("preference", refs.preference)))?;
        }
        Commands::Upgrade(_) => {
            b.methods.upgrade(&vm).await?;
            print(cli.output, &"ok", || format!("revisions of {}/{} are current", ns, vm.name()))?;
        }
        Commands::RevisionName { .. } => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!(error = ?e, "command failed");
        return Err(e);
    }
    Ok(())
}
