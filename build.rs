fn main() {
    // Only generate protobuf code when PROTO_CODE_GEN=1 is set
    if std::env::var("PROTO_CODE_GEN").unwrap_or("0".to_string()) != "1" {
        return;
    }

    let proto_out_dir = "src/generated";
    std::fs::create_dir_all(proto_out_dir)
        .unwrap_or_else(|e| panic!("failed to create proto output directory: {:?}", e));

    // Server stubs back the in-process platform used by the stream tests.
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .out_dir(proto_out_dir)
        .compile_protos(&["proto/driver.proto", "proto/datarelay.proto"], &["proto"])
        .unwrap_or_else(|e| panic!("failed to compile the proto, {:?}", e));
}
