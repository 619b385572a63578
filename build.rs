fn main() {
    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .compile(
            &["proto/exchange/v1/trading.proto"],
            &["proto"],
        )
        .expect("failed to compile protos");
}
