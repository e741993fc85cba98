use data_contracts::annotation::{Annotation, ImageLabel, ValidationError};

#[test]
fn out_of_range_center_rejected() {
    let label = ImageLabel {
        image: "images/000012.png".into(),
        objects: vec![Annotation {
            class_id: 3,
            cx: 1.4,
            cy: 0.5,
            w: 0.2,
            h: 0.2,
        }],
    };
    let err = label.validate().unwrap_err();
    assert!(matches!(err, ValidationError::CenterOutOfRange(..)));
}

#[test]
fn valid_label_passes() {
    let label = ImageLabel {
        image: "images/000012.png".into(),
        objects: vec![
            Annotation {
                class_id: 0,
                cx: 0.5,
                cy: 0.5,
                w: 0.25,
                h: 0.4,
            },
            Annotation {
                class_id: 7,
                cx: 0.1,
                cy: 0.9,
                w: 0.05,
                h: 0.08,
            },
        ],
    };
    assert!(label.validate().is_ok());
}

#[test]
fn label_json_round_trips() {
    let raw = r#"{"image":"images/frame.png","objects":[{"class_id":1,"cx":0.5,"cy":0.25,"w":0.1,"h":0.2}]}"#;
    let label: ImageLabel = serde_json::from_str(raw).unwrap();
    assert_eq!(label.objects.len(), 1);
    assert_eq!(label.objects[0].class_id, 1);
    assert!(label.validate().is_ok());
}
