//! Prints every LBops CRD manifest as a multi-document YAML stream.
//!
//! Usage: `cargo run -p crds --bin crdgen > config/crd/all.yaml`

use crds::{ExternalDNS, IngressLink, Policy, TLSProfile, TransportServer, VirtualServer, IPAM};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [
        VirtualServer::crd(),
        TransportServer::crd(),
        IngressLink::crd(),
        ExternalDNS::crd(),
        Policy::crd(),
        TLSProfile::crd(),
        IPAM::crd(),
    ];

    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }

    Ok(())
}
