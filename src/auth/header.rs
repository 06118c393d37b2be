use pom::utf8::{any, end, one_of, seq, sym, Parser};

pub enum AuthHeader<'a> {
    LeaseMqApiV1 { key: &'a str },
    Bearer { token: &'a str },
}

impl<'a> AuthHeader<'a> {
    /// The credential carried by the header, whatever the scheme.
    pub fn secret(&self) -> &'a str {
        match self {
            Self::LeaseMqApiV1 { key } => key,
            Self::Bearer { token } => token,
        }
    }
}

/// Base58 alphabet, the encoding of generated keys.
pub fn token<'a>() -> Parser<'a, &'a str> {
    one_of("123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz")
        .repeat(1..)
        .collect()
}

fn leasemq_api_v1<'a>() -> Parser<'a, AuthHeader<'a>> {
    let tag = seq("LeaseMqApiV1");
    let space = sym(' ').repeat(1..);

    ((tag + space) * token() - end())
        .map(|key| AuthHeader::LeaseMqApiV1 { key })
        .name("leasemq api v1")
}

fn bearer<'a>() -> Parser<'a, AuthHeader<'a>> {
    let tag = seq("Bearer");
    let space = sym(' ').repeat(1..);
    let rest = any().repeat(1..).collect();

    ((tag + space) * rest - end())
        .map(|token| AuthHeader::Bearer { token })
        .name("bearer auth")
}

pub fn auth_header<'a>() -> Parser<'a, AuthHeader<'a>> {
    (leasemq_api_v1() | bearer()).name("auth header")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leasemq_api_v1_valid() {
        let input = "LeaseMqApiV1 4vJ9JU1bJJE96FWSJKvHsmmFADCg4gpZQff4P3bkLKi";
        let result = auth_header().parse(input.as_bytes());

        assert!(result.is_ok(), "{:?}", result.err());

        match result {
            Ok(AuthHeader::LeaseMqApiV1 { key }) => {
                assert_eq!(key, "4vJ9JU1bJJE96FWSJKvHsmmFADCg4gpZQff4P3bkLKi");
            }
            _ => panic!("Expected LeaseMqApiV1 variant"),
        }
    }

    #[test]
    fn test_leasemq_api_v1_invalid() {
        // Missing space after scheme
        let input = "LeaseMqApiV14vJ9JU1bJJE96FWSJKvHsmm";
        assert!(auth_header().parse(input.as_bytes()).is_err());

        // Characters outside the base58 alphabet
        let input = "LeaseMqApiV1 abc0OIl";
        assert!(auth_header().parse(input.as_bytes()).is_err());

        // Empty key
        let input = "LeaseMqApiV1 ";
        assert!(auth_header().parse(input.as_bytes()).is_err());
    }

    #[test]
    fn test_bearer_valid() {
        let input = "Bearer some.opaque-token";
        let result = auth_header().parse(input.as_bytes());

        match result {
            Ok(header @ AuthHeader::Bearer { .. }) => {
                assert_eq!(header.secret(), "some.opaque-token");
            }
            _ => panic!("Expected Bearer variant"),
        }
    }

    #[test]
    fn test_unknown_scheme() {
        let input = "Basic dXNlcjpwYXNz";
        assert!(auth_header().parse(input.as_bytes()).is_err());
    }
}
