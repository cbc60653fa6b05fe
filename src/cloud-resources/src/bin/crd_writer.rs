// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Writes the operator's custom resource definitions as a Kubernetes `List`,
//! ready for `kubectl apply -f`.

use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;
use kube::CustomResourceExt;

use citus_cloud_resources::crd::backup::v1alpha1::{BackupRequest, RestoreRequest};
use citus_cloud_resources::crd::cluster::v1alpha1::CitusCluster;
use citus_cloud_resources::crd::database::v1alpha1::DatabaseRequest;

#[derive(Debug, clap::Parser)]
#[clap(about = "Print the Citus operator CRDs")]
struct Args {
    /// Write to this file instead of stdout.
    #[clap(long, short)]
    output: Option<PathBuf>,
    /// Emit compact JSON.
    #[clap(long)]
    compact: bool,
}

fn main() -> Result<(), anyhow::Error> {
    let args: Args = citus_ore::cli::parse_args();

    let list = serde_json::json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": [
            CitusCluster::crd(),
            DatabaseRequest::crd(),
            BackupRequest::crd(),
            RestoreRequest::crd(),
        ],
    });
    let mut rendered = if args.compact {
        serde_json::to_string(&list)?
    } else {
        serde_json::to_string_pretty(&list)?
    };
    rendered.push('\n');

    match args.output {
        Some(path) => fs::write(&path, rendered)
            .with_context(|| format!("writing {}", path.display()))?,
        None => io::stdout().lock().write_all(rendered.as_bytes())?,
    }
    Ok(())
}
