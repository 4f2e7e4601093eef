//! CRD installation
//!
//! The operator applies its own CRDs on startup with server-side apply, so
//! the schema in the cluster always matches the running binary.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use stowage_common::crd::{BackupRun, BackupSchedule, BackupStorage};
use stowage_common::FIELD_MANAGER;

/// CRD definition with name and resource
struct CrdDef {
    name: String,
    crd: CustomResourceDefinition,
}

fn def<K: CustomResourceExt>() -> CrdDef {
    CrdDef {
        name: K::crd_name().to_string(),
        crd: K::crd(),
    }
}

/// Every CRD served by the operator, dependencies first
fn all_crds() -> Vec<CrdDef> {
    vec![
        def::<BackupStorage>(),
        def::<BackupSchedule>(),
        def::<BackupRun>(),
    ]
}

/// Multi-document YAML of every CRD
pub fn render_crds() -> anyhow::Result<String> {
    let docs = all_crds()
        .iter()
        .map(|def| {
            serde_yaml::to_string(&def.crd)
                .map_err(|e| anyhow::anyhow!("failed to serialize {} CRD: {}", def.name, e))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(docs.join("---\n"))
}

/// Apply every CRD using server-side apply
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in all_crds() {
        tracing::info!("Installing {} CRD...", def.name);
        crds.patch(&def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }
    tracing::info!("All stowage CRDs installed/updated");
    Ok(())
}
