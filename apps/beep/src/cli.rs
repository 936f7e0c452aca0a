use std::net::SocketAddr;

use beep_core::Role;
use clap::{Args, Parser, Subcommand};
use url::Url;

#[derive(Parser, Debug)]
#[command(
    name = "beep",
    version,
    about = "Two-party WebRTC demo: Alice streams a square-wave beep, Bob listens"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate the tone and send the offer.
    Alice(AliceArgs),
    /// Wait for an offer and answer it.
    Bob(BobArgs),
}

#[derive(Args, Debug)]
pub struct AliceArgs {
    /// Address the answer endpoint listens on.
    #[arg(long, env = "BEEP_ALICE_LISTEN", default_value = "0.0.0.0:6666")]
    pub listen: SocketAddr,

    /// Bob's offer endpoint.
    #[arg(long, env = "BEEP_ALICE_PEER", default_value = "http://localhost:7777/offer")]
    pub peer: Url,
}

#[derive(Args, Debug)]
pub struct BobArgs {
    /// Address the offer endpoint listens on.
    #[arg(long, env = "BEEP_BOB_LISTEN", default_value = "0.0.0.0:7777")]
    pub listen: SocketAddr,

    /// Alice's answer endpoint.
    #[arg(long, env = "BEEP_BOB_PEER", default_value = "http://localhost:6666/answer")]
    pub peer: Url,
}

/// Where one side listens and where it sends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub role: Role,
    pub listen: SocketAddr,
    /// Path inbound signals are posted to.
    pub path: &'static str,
    pub peer: Url,
}

impl Command {
    pub fn endpoints(&self) -> Endpoints {
        match self {
            Command::Alice(args) => Endpoints {
                role: Role::Instigator,
                listen: args.listen,
                path: "/answer",
                peer: args.peer.clone(),
            },
            Command::Bob(args) => Endpoints {
                role: Role::Responder,
                listen: args.listen,
                path: "/offer",
                peer: args.peer.clone(),
            },
        }
    }
}
