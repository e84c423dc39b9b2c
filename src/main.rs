use clap::Parser;
use mimalloc::MiMalloc;

// Decompression buffers are allocated and freed from many threads at once
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use payload_extract::cmd::Cmd;

fn main() {
    if let Err(e) = Cmd::parse().run() {
        eprintln!("\nERROR: {:#}", e);
        std::process::exit(1);
    }
}
