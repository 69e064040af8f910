use dicom_dul::pdu::reader::read_pdu;
use dicom_dul::pdu::writer::write_pdu;
use dicom_dul::pdu::{
    AbortRQServiceProviderReason, AbortRQSource, AssociationRJResult, AssociationRJSource,
    AssociationRJServiceUserReason, PDataValue, PDataValueType, Pdu, PresentationContextProposed,
    PresentationContextResult, PresentationContextResultReason, UserIdentity, UserIdentityType,
    UserVariableItem, DEFAULT_MAX_PDU,
};
use matches::matches;
use std::io::Cursor;

fn roundtrip(pdu: &Pdu) -> Pdu {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, pdu).expect("write must succeed");
    read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true).expect("read must succeed")
}

#[test]
fn can_read_write_associate_rq() {
    let pdu = Pdu::AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "MAIN-STORAGE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextProposed {
                id: 1,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.2".to_string(),
                transfer_syntaxes: vec![
                    "1.2.840.10008.1.2.1".to_string(),
                    "1.2.840.10008.1.2".to_string(),
                ],
            },
            PresentationContextProposed {
                id: 3,
                abstract_syntax: "1.2.840.10008.5.1.4.1.1.4".to_string(),
                transfer_syntaxes: vec!["1.2.840.10008.1.2.4.70".to_string()],
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(16_384),
            UserVariableItem::ImplementationClassUID("2.25.1".to_string()),
            UserVariableItem::ImplementationVersionName("TEST 0.1".to_string()),
        ],
    };

    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn can_read_write_associate_rq_with_user_identity() {
    let pdu = Pdu::AssociationRQ {
        protocol_version: 1,
        calling_ae_title: "calling ae".to_string(),
        called_ae_title: "called ae".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![PresentationContextProposed {
            id: 1,
            abstract_syntax: "abstract 1".to_string(),
            transfer_syntaxes: vec!["transfer 1".to_string()],
        }],
        user_variables: vec![
            UserVariableItem::MaxLength(23),
            UserVariableItem::SopClassExtendedNegotiationSubItem(
                "abstract 1".to_string(),
                vec![1, 1, 0, 1, 1, 0, 1],
            ),
            UserVariableItem::UserIdentityItem(UserIdentity::new(
                false,
                UserIdentityType::UsernamePassword,
                b"MyUsername".to_vec(),
                b"MyPassword".to_vec(),
            )),
        ],
    };

    let result = roundtrip(&pdu);

    if let Pdu::AssociationRQ { user_variables, .. } = result {
        assert_eq!(user_variables.len(), 3);
        assert!(matches!(user_variables[0], UserVariableItem::MaxLength(l) if l == 23));
        assert!(matches!(&user_variables[1],
            UserVariableItem::SopClassExtendedNegotiationSubItem(sop_class_uid, data)
            if sop_class_uid == "abstract 1" && data.as_slice() == [1, 1, 0, 1, 1, 0, 1]
        ));
        assert!(matches!(&user_variables[2],
            UserVariableItem::UserIdentityItem(user_identity)
            if !user_identity.positive_response_requested()
            && user_identity.identity_type() == UserIdentityType::UsernamePassword
            && user_identity.primary_field() == b"MyUsername"
            && user_identity.secondary_field() == b"MyPassword"
        ));
    } else {
        panic!("invalid pdu type");
    }
}

#[test]
fn can_read_write_associate_ac() {
    let pdu = Pdu::AssociationAC {
        protocol_version: 1,
        calling_ae_title: "STORE-SCU".to_string(),
        called_ae_title: "MAIN-STORAGE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                reason: PresentationContextResultReason::Acceptance,
                transfer_syntax: "1.2.840.10008.1.2.1".to_string(),
            },
            PresentationContextResult {
                id: 3,
                reason: PresentationContextResultReason::AbstractSyntaxNotSupported,
                transfer_syntax: "1.2.840.10008.1.2".to_string(),
            },
        ],
        user_variables: vec![
            UserVariableItem::MaxLength(32_768),
            UserVariableItem::ImplementationClassUID("2.25.2".to_string()),
        ],
    };

    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn can_read_write_associate_rj() {
    let pdu = Pdu::AssociationRJ {
        result: AssociationRJResult::Permanent,
        source: AssociationRJSource::ServiceUser(
            AssociationRJServiceUserReason::CalledAETitleNotRecognized,
        ),
    };

    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn can_read_write_pdata() {
    let pdu = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Command,
                is_last: true,
                data: vec![0, 0, 0, 0],
            },
            PDataValue {
                presentation_context_id: 3,
                value_type: PDataValueType::Data,
                is_last: false,
                data: vec![9; 128],
            },
        ],
    };

    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn can_read_write_release_and_abort() {
    assert_eq!(roundtrip(&Pdu::ReleaseRQ), Pdu::ReleaseRQ);
    assert_eq!(roundtrip(&Pdu::ReleaseRP), Pdu::ReleaseRP);

    let abort = Pdu::AbortRQ {
        source: AbortRQSource::ServiceProvider(AbortRQServiceProviderReason::UnexpectedPdu),
    };
    assert_eq!(roundtrip(&abort), abort);

    let abort = Pdu::AbortRQ {
        source: AbortRQSource::ServiceUser,
    };
    assert_eq!(roundtrip(&abort), abort);
}

#[test]
fn refuses_oversized_pdu_when_strict() {
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            presentation_context_id: 1,
            value_type: PDataValueType::Data,
            is_last: true,
            data: vec![0; 8_192],
        }],
    };

    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).unwrap();

    // strict mode refuses, lenient mode tolerates
    let strict = read_pdu(&mut Cursor::new(&bytes), 4_096, true);
    assert!(strict.is_err());

    let lenient = read_pdu(&mut Cursor::new(&bytes), 4_096, false).unwrap();
    assert_eq!(lenient, pdu);
}
