//! Server entry point, grounded on the teacher's `lib.rs::handle_forever`
//! accept loop — generalized here into [`vesta_repos::dispatch::Dispatcher`]
//! driving a [`vesta_repos::repository::Repository`] instead of the
//! teacher's fixed NFS `Vfs` task trio.

use std::sync::Arc;

use clap::Parser;
use num_traits::FromPrimitive;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use vesta_repos::atomic;
use vesta_repos::config::{Cli, FileConfig, RepositoryConfig};
use vesta_repos::dispatch::{CallHandler, Dispatcher};
use vesta_repos::repository::Repository;
use vesta_repos::source::{ArcName, SourceOps, VrError};
use vesta_repos::srpc::{Endpoint, Failure, FailureReason};
use vesta_repos::surrogate::{
    dupe_check_from_i32, insert_kind_from_i32, kind_to_i32, recv_identity, recv_program, recv_source, send_outcome,
    send_source, send_vr_result, ProcId,
};

/// Binds the dispatcher's generic `call` callback to the `Repository`'s
/// `SourceOps`/atomic-program surface. Grounded on the teacher's
/// `vfs_task::VfsTask` dispatch-by-procedure-number match arm: one arm
/// per procedure, each decoding its own arguments and driving the reply.
struct RepositoryHandler {
    repo: Arc<Repository>,
}

impl RepositoryHandler {
    /// Services one call already past its `StartCall` header: reads
    /// arguments, consumes the caller's `End` item (no ack — see
    /// [`Endpoint::recv_end`]'s callee-role semantics), runs the
    /// operation, then writes the reply and blocks on the caller's
    /// `EndAck` via its own `send_end`.
    async fn dispatch(&self, proc: ProcId, ep: &mut Endpoint<tokio::net::TcpStream>) -> Result<(), Failure> {
        match proc {
            ProcId::Lookup => {
                let dir = recv_source(ep).await.map_err(failure)?;
                let arc = arc_name(ep).await?;
                let identity = recv_identity(ep).await.map_err(failure)?;
                ep.recv_end().await?;
                let result = self.repo.lookup(&dir, &arc, &identity).await;
                send_vr_result(ep, result.as_ref().map(|_| ()).map_err(|e| *e)).await?;
                if let Ok(found) = &result {
                    send_source(ep, found).await?;
                }
                ep.send_end().await
            }
            ProcId::LookupIndex => {
                let dir = recv_source(ep).await.map_err(failure)?;
                let index = ep.recv_int32().await? as u32;
                let identity = recv_identity(ep).await.map_err(failure)?;
                ep.recv_end().await?;
                let result = self.repo.lookup_index(&dir, index, &identity).await;
                send_vr_result(ep, result.as_ref().map(|_| ()).map_err(|e| *e)).await?;
                if let Ok((found, arc)) = &result {
                    send_source(ep, found).await?;
                    ep.send_text(arc.as_str()).await?;
                }
                ep.send_end().await
            }
            ProcId::List => {
                let dir = recv_source(ep).await.map_err(failure)?;
                let first_index = ep.recv_int32().await? as u32;
                let delta_only = ep.recv_bool().await?;
                let identity = recv_identity(ep).await.map_err(failure)?;
                ep.recv_end().await?;
                let result = self.repo.list(&dir, first_index, delta_only, &identity).await;
                send_vr_result(ep, result.as_ref().map(|_| ()).map_err(|e| *e)).await?;
                if let Ok(entries) = &result {
                    ep.send_int32(entries.len() as i32).await?;
                    for entry in entries {
                        ep.send_text(entry.arc.as_str()).await?;
                        ep.send_int32(kind_to_i32(entry.kind)).await?;
                        ep.send_int32(entry.index as i32).await?;
                        ep.send_int32(entry.pseudo_inode as i32).await?;
                        match entry.shortid {
                            Some(sid) => {
                                ep.send_bool(true).await?;
                                ep.send_int32(sid.0 as i32).await?;
                            }
                            None => ep.send_bool(false).await?,
                        }
                        ep.send_bool(entry.master).await?;
                    }
                }
                ep.send_end().await
            }
            ProcId::Insert => {
                let dir = recv_source(ep).await.map_err(failure)?;
                let kind = insert_kind_from_i32(ep.recv_int32().await?).map_err(failure)?;
                let arc = arc_name(ep).await?;
                let master = ep.recv_bool().await?;
                let dupe_check = dupe_check_from_i32(ep.recv_int32().await?).map_err(failure)?;
                let has_fp = ep.recv_bool().await?;
                let fptag = if has_fp {
                    let bytes = ep.recv_bytes().await?;
                    let arr: [u8; vesta_repos::longid::FP_LEN] =
                        bytes.try_into().map_err(|_| Failure::new(FailureReason::ProtocolViolation, "bad fptag length"))?;
                    Some(vesta_repos::longid::FpTag(arr))
                } else {
                    None
                };
                let identity = recv_identity(ep).await.map_err(failure)?;
                ep.recv_end().await?;
                let result = self.repo.insert(&dir, kind, &arc, master, dupe_check, fptag, &identity).await;
                send_vr_result(ep, result.as_ref().map(|_| ()).map_err(|e| *e)).await?;
                if let Ok(created) = &result {
                    send_source(ep, created).await?;
                }
                ep.send_end().await
            }
            ProcId::ReallyDelete => {
                let dir = recv_source(ep).await.map_err(failure)?;
                let arc = arc_name(ep).await?;
                let exist_check = ep.recv_bool().await?;
                let identity = recv_identity(ep).await.map_err(failure)?;
                ep.recv_end().await?;
                let result = self.repo.really_delete(&dir, &arc, exist_check, &identity).await;
                send_vr_result(ep, result).await?;
                ep.send_end().await
            }
            ProcId::RenameTo => {
                let target_dir = recv_source(ep).await.map_err(failure)?;
                let target_arc = arc_name(ep).await?;
                let from_dir = recv_source(ep).await.map_err(failure)?;
                let from_arc = arc_name(ep).await?;
                let identity = recv_identity(ep).await.map_err(failure)?;
                ep.recv_end().await?;
                let result = self.repo.rename_to(&target_dir, &target_arc, &from_dir, &from_arc, &identity).await;
                send_vr_result(ep, result).await?;
                ep.send_end().await
            }
            ProcId::MakeMutable => {
                let src = recv_source(ep).await.map_err(failure)?;
                let has_sid = ep.recv_bool().await?;
                let new_shortid = if has_sid {
                    Some(vesta_repos::longid::ShortId(ep.recv_int32().await? as u32))
                } else {
                    None
                };
                let copy_max = ep.recv_int64().await? as u64;
                let identity = recv_identity(ep).await.map_err(failure)?;
                ep.recv_end().await?;
                let result = self.repo.make_mutable(&src, new_shortid, copy_max, &identity).await;
                send_vr_result(ep, result.as_ref().map(|_| ()).map_err(|e| *e)).await?;
                if let Ok(updated) = &result {
                    send_source(ep, updated).await?;
                }
                ep.send_end().await
            }
            ProcId::MakeFilesImmutable => {
                let root = recv_source(ep).await.map_err(failure)?;
                let threshold = ep.recv_int64().await? as u64;
                let identity = recv_identity(ep).await.map_err(failure)?;
                ep.recv_end().await?;
                let result = self.repo.make_files_immutable(&root, threshold, &identity).await;
                send_vr_result(ep, result).await?;
                ep.send_end().await
            }
            ProcId::Read => {
                let file = recv_source(ep).await.map_err(failure)?;
                let offset = ep.recv_int64().await? as u64;
                let nbytes = ep.recv_int32().await? as u32;
                let identity = recv_identity(ep).await.map_err(failure)?;
                ep.recv_end().await?;
                let result = self.repo.read(&file, offset, nbytes, &identity).await;
                send_vr_result(ep, result.as_ref().map(|_| ()).map_err(|e| *e)).await?;
                if let Ok(data) = &result {
                    ep.send_bytes(data).await?;
                }
                ep.send_end().await
            }
            ProcId::Write => {
                let file = recv_source(ep).await.map_err(failure)?;
                let offset = ep.recv_int64().await? as u64;
                let data = ep.recv_bytes().await?;
                let identity = recv_identity(ep).await.map_err(failure)?;
                ep.recv_end().await?;
                let result = self.repo.write(&file, offset, &data, &identity).await;
                send_vr_result(ep, result).await?;
                ep.send_end().await
            }
            ProcId::SetMaster => {
                let src = recv_source(ep).await.map_err(failure)?;
                let master = ep.recv_bool().await?;
                let identity = recv_identity(ep).await.map_err(failure)?;
                ep.recv_end().await?;
                let result = self.repo.set_master(&src, master, &identity).await;
                send_vr_result(ep, result).await?;
                ep.send_end().await
            }
            ProcId::MeasureDirectory => {
                let dir = recv_source(ep).await.map_err(failure)?;
                let identity = recv_identity(ep).await.map_err(failure)?;
                ep.recv_end().await?;
                let result = self.repo.measure_directory(&dir, &identity).await;
                send_vr_result(ep, result.as_ref().map(|_| ()).map_err(|e| *e)).await?;
                if let Ok(m) = &result {
                    ep.send_int32(m.base_chain_length as i32).await?;
                    ep.send_int64(m.used_entry_count as i64).await?;
                    ep.send_int64(m.used_entry_size as i64).await?;
                    ep.send_int64(m.total_entry_count as i64).await?;
                    ep.send_int64(m.total_entry_size as i64).await?;
                }
                ep.send_end().await
            }
            ProcId::CollapseBase => {
                let dir = recv_source(ep).await.map_err(failure)?;
                let identity = recv_identity(ep).await.map_err(failure)?;
                ep.recv_end().await?;
                let result = self.repo.collapse_base(&dir, &identity).await;
                send_vr_result(ep, result).await?;
                ep.send_end().await
            }
            ProcId::GetBase => {
                let dir = recv_source(ep).await.map_err(failure)?;
                let identity = recv_identity(ep).await.map_err(failure)?;
                ep.recv_end().await?;
                let result = self.repo.get_base(&dir, &identity).await;
                send_vr_result(ep, result.as_ref().map(|_| ()).map_err(|e| *e)).await?;
                if let Ok(base) = &result {
                    match base {
                        Some(b) => {
                            ep.send_bool(true).await?;
                            send_source(ep, b).await?;
                        }
                        None => ep.send_bool(false).await?,
                    }
                }
                ep.send_end().await
            }
            ProcId::ReadWhole => {
                use std::io::Write;
                // The surrogate's `read_whole` never sends an identity on
                // the wire (see `Surrogate::read_whole`); unrestricted
                // read access here mirrors that client-side contract.
                let identity = vesta_repos::access::Identity::Global(vesta_repos::access::GlobalIdentity {
                    name: String::new(),
                    origin: None,
                    read_only: true,
                });
                let file = recv_source(ep).await.map_err(failure)?;
                let _offset = ep.recv_int32().await?;
                let chunk_budget = ep.recv_int32().await? as u32;
                ep.recv_end().await?;
                let result = self.repo.read(&file, 0, chunk_budget, &identity).await;
                send_vr_result(ep, result.as_ref().map(|_| ()).map_err(|e| *e)).await?;
                if let Ok(data) = &result {
                    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
                    encoder.write_all(data).map_err(|e| Failure::new(FailureReason::InternalTrouble, e.to_string()))?;
                    let compressed = encoder.finish().map_err(|e| Failure::new(FailureReason::InternalTrouble, e.to_string()))?;
                    ep.send_bytes(&compressed).await?;
                }
                ep.send_end().await
            }
            ProcId::Atomic => {
                let now = ep.recv_int64().await?;
                let program = recv_program(ep).await.map_err(failure)?;
                let identity = recv_identity(ep).await.map_err(failure)?;
                ep.recv_end().await?;
                let outcome = atomic::run(&self.repo, &identity, now, &program).await;
                send_vr_result(ep, Ok(())).await?;
                send_outcome(ep, &outcome).await?;
                ep.send_end().await
            }
        }
    }
}

fn failure(e: VrError) -> Failure {
    Failure::new(FailureReason::InvalidParameter, e.to_string())
}

async fn arc_name(ep: &mut Endpoint<tokio::net::TcpStream>) -> Result<ArcName, Failure> {
    let text = ep.recv_text().await?;
    ArcName::new(text).map_err(|_| Failure::new(FailureReason::InvalidParameter, "arc too long"))
}

#[async_trait::async_trait]
impl CallHandler for RepositoryHandler {
    async fn call(&self, call_id: (i32, i32), endpoint: &mut Endpoint<tokio::net::TcpStream>) -> Result<(), Failure> {
        match ProcId::from_i32(call_id.0) {
            Some(proc) => self.dispatch(proc, endpoint).await,
            None => endpoint.send_failure(FailureReason::UnknownInterface, &format!("proc {} not recognized", call_id.0), false).await,
        }
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let file = match &cli.config {
        Some(path) => Some(FileConfig::load(path).unwrap_or_else(|e| {
            eprintln!("failed to load {}: {e}", path.display());
            std::process::exit(1);
        })),
        None => None,
    };
    let config = RepositoryConfig::resolve(&cli, file).unwrap_or_else(|e| {
        eprintln!("invalid configuration: {e}");
        std::process::exit(1);
    });

    let repo = Repository::new(config.policy.clone(), config.realm.clone());
    let handler = RepositoryHandler { repo };
    let dispatcher = Arc::new(Dispatcher::new(handler, config.dispatch_config.clone()));

    let listener = TcpListener::bind((config.listen_address, config.listen_port)).await?;
    tracing::info!(address = %config.listen_address, port = config.listen_port, "repository server listening");

    dispatcher.serve_forever(listener).await;
    Ok(())
}
