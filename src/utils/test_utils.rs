//! Helpers shared by unit tests across the crate.

use serde_json::{json, Value};
use tokio::io::AsyncReadExt;

pub fn should_skip_httpmock() -> bool {
    if can_bind_localhost() {
        return false;
    }
    eprintln!("skipping httpmock test: sandbox forbids binding to localhost");
    true
}

fn can_bind_localhost() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(listener) => {
            drop(listener);
            true
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => false,
        Err(err) => panic!("failed to bind localhost for httpmock tests: {err}"),
    }
}

/// Keeps reqwest from routing loopback test traffic through a proxy.
pub fn clear_proxy_env() {
    std::env::remove_var("HTTP_PROXY");
    std::env::remove_var("http_proxy");
    std::env::remove_var("HTTPS_PROXY");
    std::env::remove_var("https_proxy");
    std::env::remove_var("ALL_PROXY");
    std::env::remove_var("all_proxy");
    std::env::set_var("NO_PROXY", "*");
    std::env::set_var("no_proxy", "*");
}

pub fn sample_tool(name: &str) -> rust_mcp_schema::Tool {
    rust_mcp_schema::Tool {
        annotations: None,
        description: Some(format!("{name} tool")),
        execution: None,
        icons: Vec::new(),
        input_schema: rust_mcp_schema::ToolInputSchema::new(Vec::new(), None, None),
        meta: None,
        name: name.to_string(),
        output_schema: None,
        title: None,
    }
}

pub fn initialize_result_body(id: i64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {
            "protocolVersion": crate::mcp::transport::http::MCP_PROTOCOL_VERSION,
            "capabilities": {},
            "serverInfo": {"name": "fixture", "version": "1.0.0", "icons": []}
        }
    })
}

pub fn tools_list_body(id: i64, names: &[&str]) -> Value {
    let tools: Vec<Value> = names
        .iter()
        .map(|name| {
            json!({
                "name": name,
                "description": format!("{name} tool"),
                "inputSchema": {"type": "object", "properties": {}, "required": []},
                "icons": []
            })
        })
        .collect();
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": {"tools": tools}
    })
}

pub async fn read_http_request(
    stream: &mut tokio::net::TcpStream,
) -> Result<(String, Vec<(String, String)>, Vec<u8>), String> {
    let mut buffer = Vec::new();
    let mut header_end = None;
    while header_end.is_none() {
        let mut chunk = [0_u8; 1024];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("Unexpected EOF while reading HTTP headers".to_string());
        }
        buffer.extend_from_slice(&chunk[..read]);
        header_end = buffer
            .windows(4)
            .position(|window| window == b"\r\n\r\n")
            .map(|index| index + 4);
    }

    let header_end = header_end.expect("header end should exist");
    let header_text =
        std::str::from_utf8(&buffer[..header_end]).map_err(|err| err.to_string())?;
    let mut lines = header_text.split("\r\n").filter(|line| !line.is_empty());
    let request_line = lines
        .next()
        .ok_or_else(|| "Missing HTTP request line".to_string())?
        .to_string();

    let mut headers = Vec::new();
    let mut content_length = 0_usize;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_string();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse::<usize>().map_err(|err| err.to_string())?;
        }
        headers.push((name.to_string(), value));
    }

    let mut body = buffer[header_end..].to_vec();
    while body.len() < content_length {
        let mut chunk = vec![0_u8; content_length.saturating_sub(body.len())];
        let read = stream
            .read(&mut chunk)
            .await
            .map_err(|err| err.to_string())?;
        if read == 0 {
            return Err("Unexpected EOF while reading HTTP body".to_string());
        }
        body.extend_from_slice(&chunk[..read]);
    }

    Ok((request_line, headers, body))
}
