use enclave_core::ca::CertType;
use enclave_core::orderer::verify_block_signature;
use enclave_core::tee::{AttestationQuote, VerificationFailure};
use enclave_core::{AttestationVerifier, EnclaveConfig, EnclaveService, TeeError, TrustPolicy};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate};

fn test_config() -> EnclaveConfig {
    let mut config = EnclaveConfig::default();
    config.data_dir =
        std::env::temp_dir().join(format!("enclave-flow-test-{}", uuid::Uuid::new_v4()));
    config.root_ca_key_bits = 2048;
    config
}

fn orderer_csr(cn: &str) -> String {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(vec![cn.to_string()]).unwrap();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params.distinguished_name.push(rcgen::DnType::CommonName, cn);
    params.serialize_request(&key).unwrap().pem().unwrap()
}

#[tokio::test]
async fn root_ca_issues_orderer_certificate() {
    let config = test_config();
    let service = EnclaveService::new(&config).unwrap();
    let root_pem = service.init_root_ca().await.unwrap();

    let cert_pem = service
        .sign_certificate(&orderer_csr("orderer0.hot-chain.com"), CertType::Orderer, None)
        .await
        .unwrap();

    let (_, root_block) = parse_x509_pem(root_pem.as_bytes()).unwrap();
    let (_, root) = X509Certificate::from_der(&root_block.contents).unwrap();
    let (_, leaf_block) = parse_x509_pem(cert_pem.as_bytes()).unwrap();
    let (_, leaf) = X509Certificate::from_der(&leaf_block.contents).unwrap();

    assert_eq!(leaf.issuer().to_string(), root.subject().to_string());
    assert!(leaf.subject().to_string().contains("orderer0.hot-chain.com"));
    leaf.verify_signature(Some(root.public_key())).unwrap();

    let ku = leaf.key_usage().unwrap().unwrap().value;
    assert!(!ku.key_cert_sign());
    assert!(ku.digital_signature());
    assert!(!leaf.basic_constraints().unwrap().unwrap().value.ca);

    let _ = std::fs::remove_dir_all(&config.data_dir);
}

#[tokio::test]
async fn tampered_quote_is_rejected() {
    let config = test_config();
    let service = EnclaveService::new(&config).unwrap();
    let verifier = AttestationVerifier::permissive();

    let quote_json = service.generate_quote(b"block-12345".to_vec()).await.unwrap();
    let result = verifier.verify_quote_json(&quote_json);
    assert!(result.valid, "{}", result.reason);

    let mut quote = AttestationQuote::from_json(&quote_json).unwrap();
    quote.mr_enclave = enclave_core::Measurement::from_bytes([0u8; 32]);
    let result = verifier.verify_quote(&quote);
    assert!(!result.valid);
    assert_eq!(result.failure, Some(VerificationFailure::SignatureInvalid));

    let _ = std::fs::remove_dir_all(&config.data_dir);
}

#[tokio::test]
async fn enforced_policy_rejects_unknown_enclave() {
    let config = test_config();
    let service = EnclaveService::new(&config).unwrap();
    let quote_json = service.generate_quote(b"report".to_vec()).await.unwrap();

    let other = enclave_core::EnclaveIdentity::new(
        "other",
        "1.0.0",
        "another-enclave-build",
        "another-signer",
        enclave_core::TcbLevel(1),
        "another-root-secret",
    );
    let verifier = AttestationVerifier::new(TrustPolicy::trusting(
        other.measurements().mr_enclave,
        other.measurements().mr_signer,
    ));
    let result = verifier.verify_quote_json(&quote_json);
    assert!(!result.valid);
    assert_eq!(result.failure, Some(VerificationFailure::MeasurementNotTrusted));

    let _ = std::fs::remove_dir_all(&config.data_dir);
}

#[tokio::test]
async fn orderer_keys_survive_restart() {
    let config = test_config();
    let hot_pub = {
        let service = EnclaveService::new(&config).unwrap();
        let hot_pub = service.generate_orderer_key("hot").await.unwrap();
        service.generate_orderer_key("cold").await.unwrap();
        assert!(matches!(
            service.generate_orderer_key("hot").await,
            Err(TeeError::AlreadyInitialized(_))
        ));
        hot_pub
    };

    let restarted = EnclaveService::new(&config).unwrap();
    assert!(restarted.info().await.unwrap().resident_slots.is_empty());
    let block = b"hot-chain block #7".to_vec();
    let signature = restarted.sign_block("hot", block.clone()).await.unwrap();
    assert!(verify_block_signature(&hot_pub, &block, &signature).unwrap());
    assert!(matches!(
        restarted.sign_block("warm", block).await,
        Err(TeeError::KeyNotFound(_))
    ));

    let _ = std::fs::remove_dir_all(&config.data_dir);
}

#[tokio::test]
async fn sealed_data_bound_to_enclave_identity() {
    let config = test_config();
    let service = EnclaveService::new(&config).unwrap();
    let sealed = service.seal(b"chain-of-custody record".to_vec()).await.unwrap();

    let mut other_config = config.clone();
    other_config.code_identity = "DFIR-SGX-Enclave-Code-v2.0.1-Production".to_string();
    let other = EnclaveService::new(&other_config).unwrap();
    assert!(matches!(
        other.unseal(sealed.clone()).await,
        Err(TeeError::IntegrityError(_))
    ));
    assert_eq!(
        service.unseal(sealed).await.unwrap(),
        b"chain-of-custody record"
    );

    let _ = std::fs::remove_dir_all(&config.data_dir);
}

#[tokio::test]
async fn root_ca_reloads_after_restart() {
    let config = test_config();
    let root_pem = EnclaveService::new(&config)
        .unwrap()
        .init_root_ca()
        .await
        .unwrap();

    let restarted = EnclaveService::new(&config).unwrap();
    assert!(matches!(
        restarted.init_root_ca().await,
        Err(TeeError::AlreadyInitialized(_))
    ));
    restarted.load_root_ca().await.unwrap();
    assert_eq!(restarted.root_certificate_pem().await.unwrap(), root_pem);

    let cert = restarted
        .sign_certificate(&orderer_csr("peer0.org1.example.com"), CertType::Peer, Some(90))
        .await
        .unwrap();
    restarted.certificate_authority().verify_issued(&cert).unwrap();

    let _ = std::fs::remove_dir_all(&config.data_dir);
}
