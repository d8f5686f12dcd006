/// TLS credentials to authenticate the ingress endpoint.
#[derive(Clone, Copy, Debug)]
pub struct TlsCertificatePaths<'p> {
    /// Path to the endpoint's TLS certificate.
    pub cert: &'p str,
    /// Path to the endpoint's private key.
    pub private_key: &'p str,
}
