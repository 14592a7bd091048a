use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
};

use verifywire::{EndpointType, ServerInfo, Stage, StagedStream, new_stage};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    const ADDRESS: &str = "127.0.0.1:9091";
    const STAGE: &str = "auth_simple";
    let listener = TcpListener::bind(ADDRESS).await?;
    println!("Listening on address: {:?}", ADDRESS);

    // Every connection admits its first frame through the same client table.
    let shared = new_stage(STAGE)?.init_data();

    loop {
        let (socket, addr) = listener.accept().await?;
        let mut stage = new_stage(STAGE)?;
        stage.set_server_info(
            ServerInfo::builder("127.0.0.1", 9091)
                .with_shared(shared.clone())
                .build(),
        );
        let mut stream = StagedStream::new(stage, EndpointType::Server, socket);
        println!("receiving {} stream from a new client: {:?}", STAGE, addr);
        tokio::spawn(async move {
            loop {
                let mut buf = vec![0; 1024];
                match stream.read(&mut buf).await {
                    Ok(n) if n > 0 => {
                        println!("received message: {}", String::from_utf8_lossy(&buf[..n]));
                        stream.write_all(&buf[..n]).await?;
                        stream.flush().await?;
                        println!("echoed message");
                    }
                    Ok(_) => {
                        stream.inner_stream_mut().shutdown().await?;
                        println!("client closed connection: {:?}", addr);
                        return Ok::<(), std::io::Error>(());
                    }
                    Err(e) => {
                        stream.inner_stream_mut().shutdown().await?;
                        println!("failed to read from socket; error = {:?}", e);
                        return Err(e);
                    }
                }
            }
        });
    }
}
