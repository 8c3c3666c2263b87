//! A script used to generate the CRDs used by this project.
//!
//! Any time the CyndiPipeline spec changes, this script can be run to ensure that the CRD is
//! up-to-date and ready to be synced with the cluster.

use anyhow::{Context, Result};
use cyndi_core::crd::CyndiPipeline;
use kube::CustomResourceExt;

fn main() -> Result<()> {
    let canon = std::fs::canonicalize("..").context("error getting canonical path of current dir")?;
    let crds_path = canon.join("k8s").join("crds");
    std::fs::create_dir_all(&crds_path).with_context(|| format!("error creating {:?}", &crds_path))?;

    let pipeline = CyndiPipeline::crd();
    let pipeline_yaml = serde_yaml::to_string(&pipeline).context("error serializing CyndiPipeline CRD to yaml")?;
    std::fs::write(crds_path.join("cyndipipeline.yaml"), &pipeline_yaml).with_context(|| format!("error writing CyndiPipeline CRD to {:?}", &crds_path))?;
    println!("CyndiPipeline CRD written to {:?}", &crds_path);

    Ok(())
}
