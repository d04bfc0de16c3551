/// Issues correlation tokens for outgoing messages.
///
/// Starts at 1 and increments on every call for the lifetime of the client,
/// so a token is never reused while a request that carries it is pending.
#[derive(Debug)]
pub struct TokenGenerator {
    next: u64,
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl TokenGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_token(&mut self) -> u64 {
        let token = self.next;
        self.next = self.next.wrapping_add(1);
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one() {
        let mut tokens = TokenGenerator::new();
        assert_eq!(tokens.next_token(), 1);
        assert_eq!(tokens.next_token(), 2);
    }

    #[test]
    fn strictly_increasing() {
        let mut tokens = TokenGenerator::new();
        let issued: Vec<u64> = (0..100).map(|_| tokens.next_token()).collect();
        assert!(issued.windows(2).all(|pair| pair[0] + 1 == pair[1]));
        assert_eq!(issued.last(), Some(&100));
    }
}
