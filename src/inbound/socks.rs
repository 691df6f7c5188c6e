//! SOCKS5 inbound handshake
//!
//! Only the `NO AUTHENTICATION` method and the `CONNECT` command are served;
//! anything else is answered with the matching SOCKS5 error reply.

use anyhow::{bail, Context, Result};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SOCKS5 protocol version
pub const SOCKS5_VERSION: u8 = 0x05;

/// No authentication required
pub const SOCKS5_AUTH_METHOD_NONE: u8 = 0x00;
/// No acceptable methods
pub const SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE: u8 = 0xFF;

/// TCP CONNECT command
pub const SOCKS5_CMD_TCP_CONNECT: u8 = 0x01;

/// IPv4 address
pub const SOCKS5_ADDR_TYPE_IPV4: u8 = 0x01;
/// Domain name
pub const SOCKS5_ADDR_TYPE_DOMAIN: u8 = 0x03;
/// IPv6 address
pub const SOCKS5_ADDR_TYPE_IPV6: u8 = 0x04;

/// Succeeded
pub const SOCKS5_REPLY_SUCCEEDED: u8 = 0x00;
/// Command not supported
pub const SOCKS5_REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
/// Address type not supported
pub const SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

const SOCKS5_RESERVED: u8 = 0x00;

/// Negotiate the method and read the CONNECT request
///
/// Returns the destination `(host, port)` after the success reply has been
/// written. IP destinations are returned in their textual form.
pub async fn handshake<S>(stream: &mut S) -> Result<(String, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate(stream)
        .await
        .with_context(|| "SOCKS5 method negotiation failed")?;
    let target = read_connect(stream)
        .await
        .with_context(|| "Failed to read SOCKS5 request")?;
    send_reply(stream, SOCKS5_REPLY_SUCCEEDED).await?;
    Ok(target)
}

async fn negotiate<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let (version, num_methods) = (head[0], head[1]);

    if version != SOCKS5_VERSION {
        bail!("Unsupported SOCKS version: {}", version);
    }
    if num_methods == 0 {
        bail!("No authentication methods provided");
    }

    let mut methods = vec![0u8; num_methods as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&SOCKS5_AUTH_METHOD_NONE) {
        stream
            .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE])
            .await?;
        bail!("No acceptable authentication method");
    }

    stream
        .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE])
        .await?;
    stream.flush().await?;
    Ok(())
}

/// Read `VER CMD RSV ATYP DST.ADDR DST.PORT`
async fn read_connect<S>(stream: &mut S) -> Result<(String, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let (version, command, addr_type) = (header[0], header[1], header[3]);

    if version != SOCKS5_VERSION {
        bail!("Unsupported SOCKS version in command: {}", version);
    }
    if command != SOCKS5_CMD_TCP_CONNECT {
        send_reply(stream, SOCKS5_REPLY_COMMAND_NOT_SUPPORTED).await?;
        bail!("Unsupported command: {}", command);
    }

    let host = match addr_type {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        SOCKS5_ADDR_TYPE_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            if len == 0 {
                bail!("Empty domain name");
            }
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain).with_context(|| "Invalid UTF-8 in domain name")?
        }
        SOCKS5_ADDR_TYPE_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            Ipv6Addr::from(addr).to_string()
        }
        other => {
            send_reply(stream, SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await?;
            bail!("Unsupported address type: {}", other);
        }
    };

    let port = stream.read_u16().await?;
    Ok((host, port))
}

/// Send a reply with an unspecified bind address
pub async fn send_reply<S>(stream: &mut S, reply_code: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let reply = [
        SOCKS5_VERSION,
        reply_code,
        SOCKS5_RESERVED,
        SOCKS5_ADDR_TYPE_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect_request(addr: &[u8], port: u16) -> Vec<u8> {
        let mut request = vec![SOCKS5_VERSION, SOCKS5_CMD_TCP_CONNECT, SOCKS5_RESERVED];
        request.extend_from_slice(addr);
        request.extend_from_slice(&port.to_be_bytes());
        request
    }

    async fn run_client(request: Vec<u8>) -> (Result<(String, u16)>, Vec<u8>) {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(&[SOCKS5_VERSION, 1, SOCKS5_AUTH_METHOD_NONE])
            .await
            .unwrap();
        client.write_all(&request).await.unwrap();

        let result = handshake(&mut server).await;
        drop(server);

        let mut replies = Vec::new();
        client.read_to_end(&mut replies).await.unwrap();
        (result, replies)
    }

    #[tokio::test]
    async fn test_handshake_domain() {
        let mut addr = vec![SOCKS5_ADDR_TYPE_DOMAIN, 11];
        addr.extend_from_slice(b"example.com");
        let (result, replies) = run_client(connect_request(&addr, 443)).await;

        assert_eq!(result.unwrap(), ("example.com".to_string(), 443));
        assert_eq!(&replies[..2], &[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE]);
        assert_eq!(replies[2], SOCKS5_VERSION);
        assert_eq!(replies[3], SOCKS5_REPLY_SUCCEEDED);
        assert_eq!(replies.len(), 2 + 10);
    }

    #[tokio::test]
    async fn test_handshake_scripted_exchange() {
        let mut stream = tokio_test::io::Builder::new()
            .read(&[SOCKS5_VERSION, 2, 0x02, SOCKS5_AUTH_METHOD_NONE])
            .write(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NONE])
            .read(&connect_request(&[SOCKS5_ADDR_TYPE_IPV4, 192, 168, 1, 1], 1080))
            .write(&[SOCKS5_VERSION, SOCKS5_REPLY_SUCCEEDED, 0, SOCKS5_ADDR_TYPE_IPV4, 0, 0, 0, 0, 0, 0])
            .build();

        let target = handshake(&mut stream).await.unwrap();
        assert_eq!(target, ("192.168.1.1".to_string(), 1080));
    }

    #[tokio::test]
    async fn test_handshake_ipv4() {
        let addr = [SOCKS5_ADDR_TYPE_IPV4, 10, 0, 0, 1];
        let (result, _) = run_client(connect_request(&addr, 8080)).await;
        assert_eq!(result.unwrap(), ("10.0.0.1".to_string(), 8080));
    }

    #[tokio::test]
    async fn test_handshake_ipv6() {
        let mut addr = vec![SOCKS5_ADDR_TYPE_IPV6];
        addr.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        let (result, _) = run_client(connect_request(&addr, 80)).await;
        assert_eq!(result.unwrap(), ("::1".to_string(), 80));
    }

    #[tokio::test]
    async fn test_handshake_rejects_bind() {
        let mut request = connect_request(&[SOCKS5_ADDR_TYPE_IPV4, 127, 0, 0, 1], 80);
        request[1] = 0x02;
        let (result, replies) = run_client(request).await;

        assert!(result.is_err());
        assert_eq!(replies[3], SOCKS5_REPLY_COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_handshake_rejects_unknown_addr_type() {
        let (result, replies) = run_client(connect_request(&[0x09], 80)).await;
        assert!(result.is_err());
        assert_eq!(replies[3], SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_negotiate_requires_no_auth_method() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[SOCKS5_VERSION, 1, 0x02]).await.unwrap();

        assert!(handshake(&mut server).await.is_err());
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, vec![SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE]);
    }

    #[tokio::test]
    async fn test_negotiate_rejects_socks4() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[0x04, 1, 0x00]).await.unwrap();
        let err = handshake(&mut server).await.unwrap_err();
        assert!(format!("{:#}", err).contains("version"));
    }
}
