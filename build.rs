const PROTO_DIR: &str = "src/protos";
const UPDATE_METADATA_PROTO: &str = "src/protos/chromeos_update_engine/update_metadata.proto";

fn main() {
    println!("cargo:rerun-if-changed={UPDATE_METADATA_PROTO}");

    // protox parses the schema in-process, so builds do not need a system protoc.
    let file_descriptors = protox::compile([UPDATE_METADATA_PROTO], [PROTO_DIR])
        .expect("error parsing protobuf files");

    prost_build::Config::new()
        .compile_fds(file_descriptors)
        .expect("error compiling protobuf files");

    // Windows-specific configuration
    #[cfg(target_os = "windows")]
    {
        // Configure static linking for xz2/lzma
        println!("cargo:rustc-link-search=/usr/x86_64-w64-mingw32/lib");
        println!("cargo:rustc-link-search=/usr/mingw64/lib");
        println!("cargo:rustc-link-lib=static=lzma");

        // Force static linking of C runtime
        println!("cargo:rustc-link-arg=-static-libgcc");
        println!("cargo:rustc-link-arg=-static-libstdc++");
    }
}
