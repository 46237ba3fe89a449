//! A small CLI exercising [`vesta_repos::surrogate::Surrogate`] and
//! [`vesta_repos::atomic`] end to end against a running
//! `repository-server`. Grounded on the teacher's `shadow_fs`/`in_memory`
//! examples' "point a small binary at the library and narrate what it
//! does" shape, adapted from a mount-directory argument to a host:port.

use std::sync::Arc;

use clap::Parser;

use vesta_repos::access::{GlobalIdentity, Identity};
use vesta_repos::atomic::{Program, Step};
use vesta_repos::longid;
use vesta_repos::pool::{IdleLimit, Pool};
use vesta_repos::source::{ArcName, DupeCheck, InsertKind, Kind, Source, SourceOps};
use vesta_repos::srpc::EndpointConfig;
use vesta_repos::surrogate::Surrogate;

#[derive(Debug, Parser)]
#[command(name = "repository-client", about = "Exercise a vesta-repos server")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8569)]
    port: u16,

    #[arg(long, default_value = "guest@example.com")]
    identity: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let pool = Arc::new(Pool::new(IdleLimit::MultipleOfHighWater { factor: 2 }, EndpointConfig::default()));
    let identity = Identity::Global(GlobalIdentity { name: args.identity, origin: None, read_only: false });
    let surrogate = Surrogate::new(pool, args.host.clone(), args.port, identity.clone());

    let mutable_root = Source {
        kind: Kind::MutableDirectory,
        longid: longid::mutable_root(),
        master: true,
        pseudo_inode: 0,
        fptag: None,
    };

    let arc = ArcName::new("demo-file").expect("valid arc name");
    match surrogate
        .insert(&mutable_root, InsertKind::MutableFile, &arc, true, DupeCheck::ReplaceDiff, None, &identity)
        .await
    {
        Ok(created) => println!("created {:?} at {:?}", arc, created.longid),
        Err(e) => {
            eprintln!("insert failed: {e}");
            return;
        }
    }

    if let Err(e) = surrogate.write(&mutable_root, 0, b"hello from repository-client", &identity).await {
        eprintln!("write failed: {e}");
    }

    // A tiny atomic program: declare the mutable root, then require the
    // just-created file still be a stub-free mutable file before doing
    // anything else (a no-op `TypeCheck` guard, the pattern real client
    // programs use to fail fast instead of leaving partial state).
    let mut program = Program::new();
    program.push(Step::Declare { slot: 0, longid: longid::mutable_root() }).push(Step::Lookup {
        dir: 0,
        arc: arc.clone(),
        result: 1,
    });
    println!("composed a {}-step atomic program", program.steps().len());
}
