//! Schemas every gateway registers without touching the network.

/// A schema shipped with the crate
#[derive(Debug, Clone, Copy)]
pub struct BuiltinSchema {
    pub uri: &'static str,
    pub namespace: &'static str,
    pub text: &'static str,
}

pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

const XML_XSD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema"
           targetNamespace="http://www.w3.org/XML/1998/namespace"
           xml:lang="en">
  <xs:attribute name="lang">
    <xs:simpleType>
      <xs:union memberTypes="xs:language">
        <xs:simpleType>
          <xs:restriction base="xs:string">
            <xs:enumeration value=""/>
          </xs:restriction>
        </xs:simpleType>
      </xs:union>
    </xs:simpleType>
  </xs:attribute>
  <xs:attribute name="space">
    <xs:simpleType>
      <xs:restriction base="xs:NCName">
        <xs:enumeration value="default"/>
        <xs:enumeration value="preserve"/>
      </xs:restriction>
    </xs:simpleType>
  </xs:attribute>
  <xs:attribute name="base" type="xs:anyURI"/>
  <xs:attribute name="id" type="xs:ID"/>
  <xs:attributeGroup name="specialAttrs">
    <xs:attribute ref="xml:base"/>
    <xs:attribute ref="xml:lang"/>
    <xs:attribute ref="xml:space"/>
    <xs:attribute ref="xml:id"/>
  </xs:attributeGroup>
</xs:schema>
"#;

pub const SCHEMAS: &[BuiltinSchema] = &[BuiltinSchema {
    uri: "http://www.w3.org/2001/xml.xsd",
    namespace: XML_NAMESPACE,
    text: XML_XSD,
}];
