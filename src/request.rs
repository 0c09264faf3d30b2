// 📨 Export Request - the <ENVELOPE> Tally expects on its TDL endpoint
//
// <ENVELOPE>
//   <HEADER> VERSION / TALLYREQUEST=Export / TYPE=Collection / ID </HEADER>
//   <BODY><DESC>
//     <STATICVARIABLES> format, company, date range </STATICVARIABLES>
//     <TDL><TDLMESSAGE><COLLECTION> TYPE + FETCH </COLLECTION></TDLMESSAGE></TDL>
//   </DESC></BODY>
// </ENVELOPE>

use crate::coerce::{escape_xml, to_tally_date};
use crate::entities::Collection;
use chrono::NaiveDate;

#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    pub collection: Collection,
    /// Tally company to export from; Tally uses the active one when unset
    pub company: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl ExportRequest {
    pub fn new(collection: Collection) -> Self {
        ExportRequest {
            collection,
            company: None,
            from: None,
            to: None,
        }
    }

    pub fn company(mut self, company: impl Into<String>) -> Self {
        let company = company.into();
        self.company = (!company.trim().is_empty()).then_some(company);
        self
    }

    pub fn period(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    /// Collection ID registered by the inline TDL
    pub fn collection_id(&self) -> String {
        format!("TallySync{}", self.collection.tdl_type())
    }

    pub fn to_xml(&self) -> String {
        let id = self.collection_id();

        let mut variables = String::from("<SVEXPORTFORMAT>$$SysName:XML</SVEXPORTFORMAT>");
        if let Some(company) = &self.company {
            variables.push_str(&format!(
                "<SVCURRENTCOMPANY>{}</SVCURRENTCOMPANY>",
                escape_xml(company)
            ));
        }
        if let Some(from) = self.from {
            variables.push_str(&format!("<SVFROMDATE>{}</SVFROMDATE>", to_tally_date(from)));
        }
        if let Some(to) = self.to {
            variables.push_str(&format!("<SVTODATE>{}</SVTODATE>", to_tally_date(to)));
        }

        let fetch = self.collection.fetch_fields().join(", ");

        format!(
            "<ENVELOPE>\
<HEADER><VERSION>1</VERSION><TALLYREQUEST>Export</TALLYREQUEST><TYPE>Collection</TYPE><ID>{id}</ID></HEADER>\
<BODY><DESC>\
<STATICVARIABLES>{variables}</STATICVARIABLES>\
<TDL><TDLMESSAGE>\
<COLLECTION NAME=\"{id}\" ISMODIFY=\"No\"><TYPE>{tdl_type}</TYPE><FETCH>{fetch}</FETCH></COLLECTION>\
</TDLMESSAGE></TDL>\
</DESC></BODY>\
</ENVELOPE>",
            tdl_type = self.collection.tdl_type(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::extract_field;

    #[test]
    fn test_envelope_shape() {
        let xml = ExportRequest::new(Collection::Ledgers).to_xml();

        assert!(xml.starts_with("<ENVELOPE><HEADER>"));
        assert_eq!(extract_field(&xml, "TALLYREQUEST").as_deref(), Some("Export"));
        assert_eq!(extract_field(&xml, "TYPE").as_deref(), Some("Collection"));
        assert_eq!(extract_field(&xml, "ID").as_deref(), Some("TallySyncLedger"));
        assert!(xml.contains("<TYPE>Ledger</TYPE>"));
        assert!(xml.contains("ClosingBalance"));
        assert!(!xml.contains("SVCURRENTCOMPANY"));
        assert!(!xml.contains("SVFROMDATE"));
    }

    #[test]
    fn test_company_and_period() {
        let from = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        let to = NaiveDate::from_ymd_opt(2025, 3, 31).unwrap();
        let xml = ExportRequest::new(Collection::Vouchers)
            .company("Smith & Sons <HQ>")
            .period(Some(from), Some(to))
            .to_xml();

        assert!(xml.contains("<SVCURRENTCOMPANY>Smith &amp; Sons &lt;HQ&gt;</SVCURRENTCOMPANY>"));
        assert!(xml.contains("<SVFROMDATE>20240401</SVFROMDATE>"));
        assert!(xml.contains("<SVTODATE>20250331</SVTODATE>"));
    }

    #[test]
    fn test_blank_company_is_omitted() {
        let request = ExportRequest::new(Collection::Groups).company("  ");
        assert_eq!(request.company, None);
    }
}
