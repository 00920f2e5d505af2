//! The bit-inversion challenge/response primitive shared by the relay
//! authentication handshake and the person-and-key mutual challenge (spec
//! §4.9, §8 property 10 "Challenge inversion").
//!
//! Both uses follow the same shape: the issuer picks random bytes, encrypts
//! them to the responder's box key; the responder decrypts, inverts every
//! bit, re-encrypts with a fresh nonce, and sends that back. The issuer
//! accepts iff decrypting the response yields exactly the bitwise complement
//! of what it sent.

use meshstore_core::crypto;
use meshstore_core::error::{Error, Result};
use rand_core::{OsRng, RngCore};

pub const CHALLENGE_LEN: usize = 64;

fn complement(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().map(|b| !b).collect()
}

/// Encrypt `plain` to `their_pub` with a fresh nonce, `nonce || cyphertext`.
pub fn seal(plain: &[u8], my_sec: &[u8; 32], their_pub: &[u8; 32]) -> Result<Vec<u8>> {
    let nonce = crypto::random_nonce();
    let mut out = crypto::peer_encrypt(plain, my_sec, their_pub, &nonce)?;
    let mut framed = nonce.to_vec();
    framed.append(&mut out);
    Ok(framed)
}

/// Inverse of [`seal`].
pub fn open(sealed: &[u8], my_sec: &[u8; 32], their_pub: &[u8; 32]) -> Result<Vec<u8>> {
    if sealed.len() < crypto::NONCE_LEN {
        return Err(Error::MalformedNonce(format!(
            "sealed payload shorter than nonce prefix: {} bytes",
            sealed.len()
        )));
    }
    let (nonce, cypher) = sealed.split_at(crypto::NONCE_LEN);
    crypto::peer_decrypt(cypher, my_sec, their_pub, nonce)
}

/// Issuer half: generate a random challenge, seal it to `their_pub`, and
/// verify the reply decrypts to its bitwise complement. `send` writes the
/// sealed challenge out; `recv` awaits the sealed response.
pub async fn issue<S, R, Fut1, Fut2>(my_sec: &[u8; 32], their_pub: &[u8; 32], send: S, recv: R) -> Result<()>
where
    S: FnOnce(Vec<u8>) -> Fut1,
    Fut1: std::future::Future<Output = Result<()>>,
    R: FnOnce() -> Fut2,
    Fut2: std::future::Future<Output = Result<Vec<u8>>>,
{
    let mut plain = vec![0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut plain);

    send(seal(&plain, my_sec, their_pub)?).await?;
    let sealed_response = recv().await?;
    let response = open(&sealed_response, my_sec, their_pub)?;

    if response != complement(&plain) {
        return Err(Error::AuthenticationFailed);
    }
    Ok(())
}

/// Responder half: await a sealed challenge, invert every bit, seal the
/// result back with a fresh nonce.
pub async fn answer<R, S, Fut1, Fut2>(my_sec: &[u8; 32], their_pub: &[u8; 32], recv: R, send: S) -> Result<()>
where
    R: FnOnce() -> Fut1,
    Fut1: std::future::Future<Output = Result<Vec<u8>>>,
    S: FnOnce(Vec<u8>) -> Fut2,
    Fut2: std::future::Future<Output = Result<()>>,
{
    let sealed_challenge = recv().await?;
    let plain = open(&sealed_challenge, my_sec, their_pub)?;
    let inverted = complement(&plain);
    send(seal(&inverted, my_sec, their_pub)?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshstore_core::crypto::new_box_keypair;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn issue_and_answer_agree_on_a_correct_response() {
        let (issuer_pub, issuer_sec) = new_box_keypair();
        let (responder_pub, responder_sec) = new_box_keypair();

        let (to_responder_tx, mut to_responder_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (to_issuer_tx, mut to_issuer_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let issuer = tokio::spawn(async move {
            issue(
                &issuer_sec,
                &responder_pub,
                |sealed| {
                    let tx = to_responder_tx.clone();
                    async move {
                        tx.send(sealed).unwrap();
                        Ok(())
                    }
                },
                || async move { to_issuer_rx.recv().await.ok_or(Error::ConnectionClosed) },
            )
            .await
        });

        let responder = tokio::spawn(async move {
            answer(
                &responder_sec,
                &issuer_pub,
                || async move { to_responder_rx.recv().await.ok_or(Error::ConnectionClosed) },
                |sealed| {
                    let tx = to_issuer_tx.clone();
                    async move {
                        tx.send(sealed).unwrap();
                        Ok(())
                    }
                },
            )
            .await
        });

        issuer.await.unwrap().unwrap();
        responder.await.unwrap().unwrap();
    }

    #[test]
    fn complement_is_involutive() {
        let bytes = vec![0x00, 0xff, 0x3c];
        assert_eq!(complement(&complement(&bytes)), bytes);
    }
}
