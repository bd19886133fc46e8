// Helpers shared by the unit tests: throwaway HTTP servers on ephemeral ports.

use std::net::SocketAddr;

use axum::Router;
use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Serves `app` on 127.0.0.1 and returns the address it listens on.
pub async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// An address nothing listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// A base64 PNG of the given size, filled with one colour.
pub fn png_base64(width: u32, height: u32) -> String {
    let image = image::RgbImage::from_pixel(width, height, image::Rgb([200, 120, 80]));
    let mut buffer = std::io::Cursor::new(Vec::new());
    image::DynamicImage::ImageRgb8(image)
        .write_to(&mut buffer, image::ImageOutputFormat::Png)
        .unwrap();
    STANDARD.encode(buffer.into_inner())
}
